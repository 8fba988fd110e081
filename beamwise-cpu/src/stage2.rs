//! Stage 2: merge a row's tiles.
//!
//! One rayon task per row. The row's `n_vocab_parts` tiles compete in `2K`
//! extraction rounds; each tile is one lane holding its own best remaining
//! entry, so only the tile that lost an entry rescans. The tiles' softmax
//! accumulators are folded separately and the winners are turned into
//! log-probabilities plus the beam's cumulative log-probability.

use beamwise::{ranks_before, Extractor, LaneLayout, Md};
use rayon::prelude::*;

use crate::workspace::{TileBuffer, INVALID_ID};

/// Merge the tiles of `cum_log_probs.len()` rows into the candidate buffers.
pub(crate) fn run(
    tiles: &TileBuffer,
    cum_log_probs: &[f32],
    candidate_ids: &mut [u32],
    candidate_values: &mut [f32],
) {
    let k2 = tiles.tile_len();
    let rows = cum_log_probs.len();
    candidate_ids[..rows * k2]
        .par_chunks_mut(k2)
        .zip(candidate_values[..rows * k2].par_chunks_mut(k2))
        .enumerate()
        .for_each(|(row, (out_ids, out_values))| {
            merge_row(tiles, row, cum_log_probs[row], out_ids, out_values);
        });
}

fn merge_row(
    tiles: &TileBuffer,
    row: usize,
    cum_log_prob: f32,
    out_ids: &mut [u32],
    out_values: &mut [f32],
) {
    let k2 = tiles.tile_len();
    let (ids, values, mds) = tiles.row(row);
    let md = mds.iter().copied().fold(Md::EMPTY, Md::combine);

    let winners: Vec<(f32, u32)> = if tiles.n_parts() == 1 {
        values.iter().copied().zip(ids.iter().copied()).collect()
    } else {
        let slots = values
            .iter()
            .zip(ids)
            .map(|(&v, &id)| (id != INVALID_ID).then_some((v, id)))
            .collect();
        let beats = |a: &(f32, u32), b: &(f32, u32)| ranks_before(a.0, a.1, b.0, b.1);
        let mut extractor = Extractor::new(slots, LaneLayout::Chunked { chunk: k2 }, beats);
        let top = std::iter::from_fn(|| extractor.pop())
            .take(k2)
            .map(|(_, e)| e)
            .collect();
        top
    };

    let mut written = 0;
    let outputs = out_ids.iter_mut().zip(out_values.iter_mut());
    for ((value, id), (dst_id, dst_v)) in winners.into_iter().zip(outputs) {
        if id == INVALID_ID {
            break;
        }
        *dst_id = id;
        *dst_v = md.log_prob(value) + cum_log_prob;
        written += 1;
    }
    out_ids[written..].fill(INVALID_ID);
    out_values[written..].fill(f32::NEG_INFINITY);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage1::{self, RowSource};
    use beamwise::LaunchConfig;

    fn merged(logits: &[f32], parts: usize, k2: usize, cum: f32) -> (Vec<u32>, Vec<f32>) {
        let sources = [RowSource::Live { logits, bias: None }];
        let mut tiles = TileBuffer::new(1, parts, k2);
        let launch = LaunchConfig::base(parts).with_lanes(3);
        stage1::run(&launch, &sources, logits.len(), &mut tiles);
        let mut ids = vec![0; k2];
        let mut values = vec![0.0; k2];
        run(&tiles, &[cum], &mut ids, &mut values);
        (ids, values)
    }

    fn log_softmax(logits: &[f32]) -> Vec<f32> {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let lse = max + logits.iter().map(|x| (x - max).exp()).sum::<f32>().ln();
        logits.iter().map(|x| x - lse).collect()
    }

    #[test]
    fn test_single_part_pass_through_still_normalises() {
        let logits = [1.0f32, 5.0, 2.0, 0.0, 3.0];
        let (ids, values) = merged(&logits, 1, 4, 0.0);
        assert_eq!(ids, vec![1, 4, 2, 0]);
        let reference = log_softmax(&logits);
        for (id, v) in ids.iter().zip(&values) {
            assert!((v - reference[*id as usize]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_parts_agree_with_single_part() {
        let logits: Vec<f32> = (0..97)
            .map(|i| ((i * 31) % 23) as f32 * 0.25 - 2.0)
            .collect();
        let (ids_1, values_1) = merged(&logits, 1, 6, -1.5);
        for parts in [2, 5, 13] {
            let (ids, values) = merged(&logits, parts, 6, -1.5);
            assert_eq!(ids, ids_1, "parts={parts}");
            for (a, b) in values.iter().zip(&values_1) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_cumulative_log_prob_is_added() {
        let logits = [0.0f32, 0.0, 0.0, 0.0];
        let (_, values) = merged(&logits, 2, 2, -3.0);
        let expected = -3.0 - 4.0f32.ln();
        for v in values {
            assert!((v - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_empty_tiles_never_win() {
        // With 4 parts over 5 entries the last tile is empty
        let logits = [-1e30f32, -2e30, -3e30, -4e30, -5e30];
        let (ids, _) = merged(&logits, 4, 4, 0.0);
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }
}
