//! Stage 3: beam finalisation.
//!
//! One rayon task per batch item; everything here mutates a single
//! [`BatchItem`], so items never contend. The item's `beam_width * 2K`
//! candidates are ranked by repeated extraction, then scanned in order:
//!
//! - an end token within the first `beam_width` ranks becomes a finished
//!   candidate (if tracking is on and it beats the buffer's worst entry),
//! - any other candidate, or an end token with tracking off, fills the next
//!   free beam slot,
//! - an end token ranked below `beam_width` is dropped.
//!
//! The scan ends once every beam slot is filled. The done flag and the
//! per-beam records are updated afterwards.

use beamwise::{
    ranks_before, BatchItem, EarlyStopping, Extractor, FinishedState, LaneLayout, LengthPenalty,
};
use tracing::{debug, trace};

use crate::workspace::INVALID_ID;

/// Token chosen for one beam slot of the next step.
#[derive(Debug, Clone, Copy)]
struct Selection {
    token: u32,
    parent: usize,
    cum_log_prob: f32,
    step_log_prob: f32,
}

/// Value candidate `i` competes with: `values[i] + diversity_rate * (i / 2K)`.
#[allow(clippy::cast_precision_loss)]
fn ranking_value(values: &[f32], i: usize, k2: usize, diversity_rate: f32) -> f32 {
    values[i] + diversity_rate * (i / k2) as f32
}

/// Rank the item's candidates, best first, as indices into `values`.
#[allow(clippy::cast_possible_truncation)]
fn rank_candidates(
    ids: &[u32],
    values: &[f32],
    k2: usize,
    diversity_rate: f32,
    lanes: usize,
) -> Vec<usize> {
    let slots = ids
        .iter()
        .enumerate()
        .map(|(i, &id)| {
            let value = ranking_value(values, i, k2, diversity_rate);
            (id != INVALID_ID).then_some((value, i as u32))
        })
        .collect();
    let beats = |a: &(f32, u32), b: &(f32, u32)| ranks_before(a.0, a.1, b.0, b.1);
    let mut extractor = Extractor::new(slots, LaneLayout::Strided { lanes }, beats);
    let ranked = std::iter::from_fn(|| extractor.pop())
        .take(k2)
        .map(|(i, _)| i)
        .collect();
    ranked
}

/// Run Stage 3 for one batch item.
///
/// `ids` and `values` hold the item's `beam_width * 2K` Stage 2 candidates,
/// beam by beam. Items already marked done are left untouched.
#[allow(clippy::cast_possible_truncation, clippy::too_many_lines)]
pub(crate) fn finalize_item<P: LengthPenalty + ?Sized>(
    slot: usize,
    item: &mut BatchItem,
    ids: &[u32],
    values: &[f32],
    penalty: &P,
    lanes: usize,
) {
    if item.is_done() {
        return;
    }
    let bw = item.beam_width();
    let k2 = 2 * bw;
    let params = item.params;
    let old_cum: Vec<f32> = item.beams().iter().map(|b| b.cum_log_prob).collect();
    let ranked = rank_candidates(ids, values, k2, params.diversity_rate, lanes);

    let mut next: Vec<Selection> = Vec::with_capacity(bw);
    for (rank, &c) in ranked.iter().enumerate() {
        let (token, value, origin) = (ids[c], values[c], c / k2);
        let is_end = token == params.end_id;
        let tracking = item.candidates().is_some();

        if rank < bw && tracking && is_end {
            let beam = item.beam(origin);
            let length = beam.seq_len + 1 - beam.input_len;
            let score = penalty.normalize(value, length, params.length_penalty);
            if !item.candidates().is_some_and(|cba| cba.admits(bw, score)) {
                trace!(slot, rank, score, "finished candidate rejected");
                if params.early_stopping == EarlyStopping::Enabled {
                    break;
                }
                continue;
            }
            let hyp = item.finished_hypothesis(origin, value, score, value - old_cum[origin]);
            if let Some(cba) = item.candidates_mut() {
                match cba.insert(bw, hyp) {
                    Ok(Some(evicted)) => trace!(
                        slot,
                        score,
                        evicted = evicted.normed_score,
                        "finished candidate replaced worst"
                    ),
                    Ok(None) => trace!(
                        slot,
                        score,
                        count = cba.len(),
                        "finished candidate admitted"
                    ),
                    Err(rejected) => trace!(
                        slot,
                        score = rejected.normed_score,
                        "finished candidate rejected"
                    ),
                }
            }
        } else if rank < bw || (tracking && !is_end) {
            next.push(Selection {
                token,
                parent: origin,
                cum_log_prob: value,
                step_log_prob: value - old_cum[origin],
            });
        }

        if next.len() >= bw {
            break;
        }
    }

    let done = match (item.candidates(), ranked.first()) {
        (Some(cba), Some(&top)) if cba.is_full(bw) => match params.early_stopping {
            EarlyStopping::Enabled => true,
            mode => {
                let beam = item.beam(0);
                let top_value = ranking_value(values, top, k2, params.diversity_rate);
                let best = penalty.best_attainable(
                    top_value,
                    beam.seq_len + 1 - beam.input_len,
                    item.max_seq_len() - beam.input_len,
                    params.length_penalty,
                    mode,
                );
                cba.min_normed_score() >= best
            }
        },
        _ => false,
    };
    if done {
        item.mark_done();
        debug!(
            slot,
            finished = item.candidates().map_or(0, |cba| cba.len()),
            "batch item done"
        );
    }

    let old_len: Vec<usize> = item.beams().iter().map(|b| b.seq_len).collect();
    let new_len: Vec<usize> = item
        .beams()
        .iter()
        .map(|b| b.seq_len + usize::from(!b.finished.is_finished()))
        .collect();
    for (i, beam) in item.beams_mut().iter_mut().enumerate() {
        // Slots left empty by an early break keep their beam and end it.
        let sel = next.get(i).copied().unwrap_or(Selection {
            token: params.end_id,
            parent: i,
            cum_log_prob: old_cum[i],
            step_log_prob: 0.0,
        });
        beam.seq_len = new_len[sel.parent];
        beam.cum_log_prob = sel.cum_log_prob;
        beam.write_step(old_len[i], sel.token, sel.parent as u32, sel.step_log_prob);
        beam.finished = if done {
            FinishedState::Finished
        } else if sel.token == params.end_id {
            FinishedState::FinishedEos
        } else {
            FinishedState::NotFinished
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamwise::{
        BeamHypotheses, BeamSearchConfig, FinishedHypothesis, PowerPenalty, RequestParams,
    };

    const PROMPT: u32 = 9;

    fn setup(
        bw: usize,
        params: RequestParams,
        tweak: impl FnOnce(&mut BeamSearchConfig),
    ) -> BeamHypotheses {
        let mut config = BeamSearchConfig::new(1, bw, 10, 8);
        tweak(&mut config);
        let mut hyps = BeamHypotheses::new(&config).unwrap();
        hyps.start_request(0, params, &[PROMPT]).unwrap();
        hyps
    }

    fn seed_cba(hyps: &mut BeamHypotheses, bw: usize, score: f32) {
        let hyp = FinishedHypothesis {
            output_ids: vec![PROMPT, 0],
            cum_log_prob: score,
            normed_score: score,
            log_probs: None,
        };
        let cba = hyps.item_mut(0).candidates_mut().unwrap();
        cba.insert(bw, hyp).unwrap();
    }

    fn run(hyps: &mut BeamHypotheses, ids: &[u32], values: &[f32]) {
        finalize_item(0, hyps.item_mut(0), ids, values, &PowerPenalty, 4);
    }

    fn two_beams(params: RequestParams) -> BeamHypotheses {
        let mut hyps = setup(2, params, |_| {});
        hyps.item_mut(0).beam_mut(0).cum_log_prob = -1.0;
        hyps.item_mut(0).beam_mut(1).cum_log_prob = -2.0;
        hyps
    }

    #[test]
    fn test_rank_candidates_orders_by_value_then_index() {
        let ids = [1, 2, 3, INVALID_ID];
        let values = [0.5, 2.0, 0.5, 9.0];
        assert_eq!(rank_candidates(&ids, &values, 4, 0.0, 2), vec![1, 0, 2]);
    }

    #[test]
    fn test_fills_slots_from_best_continuations() {
        let mut hyps = two_beams(RequestParams::new(0));
        let ids = [3, 4, 5, 6, 3, 7, 8, 1];
        let values = [-1.1, -1.5, -3.0, -4.0, -2.1, -2.2, -5.0, -6.0];
        run(&mut hyps, &ids, &values);

        let item = hyps.item(0);
        assert!(item.candidates().unwrap().is_empty());
        assert!(!item.is_done());
        assert_eq!(item.beam(0).output_ids()[1], 3);
        assert_eq!(item.beam(1).output_ids()[1], 4);
        assert_eq!(item.beam(0).parent_ids()[1], 0);
        assert_eq!(item.beam(1).parent_ids()[1], 0);
        assert_eq!(item.beam(0).cum_log_prob, -1.1);
        assert_eq!(item.beam(1).cum_log_prob, -1.5);
        for beam in item.beams() {
            assert_eq!(beam.seq_len, 2);
            assert_eq!(beam.finished, FinishedState::NotFinished);
        }
        assert_eq!(item.gather(1, 2).0, vec![PROMPT, 4]);
    }

    #[test]
    fn test_top_ranked_end_token_becomes_finished_candidate() {
        let mut hyps = two_beams(RequestParams::new(0));
        let ids = [0, 4, 5, 6, 3, 7, 8, 1];
        let values = [-1.1, -1.5, -3.0, -4.0, -2.1, -2.2, -5.0, -6.0];
        run(&mut hyps, &ids, &values);

        let item = hyps.item(0);
        let cba = item.candidates().unwrap();
        assert_eq!(cba.len(), 1);
        let hyp = cba.iter().next().unwrap();
        assert_eq!(hyp.output_ids, vec![PROMPT, 0]);
        assert_eq!(hyp.cum_log_prob, -1.1);
        // length 1 with exponent 1
        assert_eq!(hyp.normed_score, -1.1);

        assert_eq!(item.beam(0).output_ids()[1], 4);
        assert_eq!(item.beam(0).parent_ids()[1], 0);
        assert_eq!(item.beam(1).output_ids()[1], 3);
        assert_eq!(item.beam(1).parent_ids()[1], 1);
        assert_eq!(item.beam(1).cum_log_prob, -2.1);
        assert!(!item.is_done());
    }

    #[test]
    fn test_low_ranked_end_token_is_dropped() {
        let mut hyps = two_beams(RequestParams::new(0));
        let ids = [0, 4, 5, 6, 0, 7, 8, 1];
        let values = [-1.1, -1.5, -1.7, -4.0, -1.6, -2.2, -5.0, -6.0];
        run(&mut hyps, &ids, &values);

        let item = hyps.item(0);
        assert_eq!(item.candidates().unwrap().len(), 1);
        assert_eq!(item.beam(0).output_ids()[1], 4);
        assert_eq!(item.beam(1).output_ids()[1], 5);
        assert_eq!(item.beam(1).parent_ids()[1], 0);
    }

    #[test]
    fn test_rejected_end_token_stops_scan_when_enabled() {
        let params = RequestParams::new(0)
            .with_length_penalty(0.0)
            .with_early_stopping(EarlyStopping::Enabled);
        let mut hyps = setup(1, params, |_| {});
        seed_cba(&mut hyps, 1, 0.9);
        run(&mut hyps, &[0, 2], &[0.5, -3.0]);

        let item = hyps.item(0);
        assert!(item.is_done());
        let cba = item.candidates().unwrap();
        assert_eq!(cba.len(), 1);
        assert_eq!(cba.min_normed_score(), 0.9);
        let beam = item.beam(0);
        assert_eq!(beam.finished, FinishedState::Finished);
        assert_eq!(beam.output_ids()[1], 0);
        assert_eq!(beam.cum_log_prob, 0.0);
    }

    #[test]
    fn test_rejected_end_token_keeps_scanning_in_never_mode() {
        let params = RequestParams::new(0)
            .with_length_penalty(0.0)
            .with_early_stopping(EarlyStopping::Never);
        let mut hyps = setup(1, params, |_| {});
        seed_cba(&mut hyps, 1, 0.9);
        run(&mut hyps, &[0, 2], &[0.5, -3.0]);

        let item = hyps.item(0);
        let beam = item.beam(0);
        assert_eq!(beam.output_ids()[1], 2);
        assert_eq!(beam.cum_log_prob, -3.0);
        // Best attainable 0.5 cannot beat the held 0.9
        assert!(item.is_done());
        assert_eq!(beam.finished, FinishedState::Finished);
    }

    #[test]
    fn test_not_done_while_live_beam_can_improve() {
        let params = RequestParams::new(0).with_length_penalty(0.0);
        let mut hyps = setup(1, params, |_| {});
        seed_cba(&mut hyps, 1, -5.0);
        run(&mut hyps, &[1, 0], &[-1.0, -2.0]);

        let item = hyps.item(0);
        assert!(!item.is_done());
        assert_eq!(item.beam(0).output_ids()[1], 1);
        assert_eq!(item.beam(0).finished, FinishedState::NotFinished);
        assert_eq!(item.beam(0).seq_len, 2);
    }

    #[test]
    fn test_never_projects_best_beam_to_max_length() {
        let outcome = |mode| {
            let params = RequestParams::new(0)
                .with_length_penalty(1.0)
                .with_early_stopping(mode);
            let mut hyps = setup(1, params, |c| c.max_seq_len = 20);
            seed_cba(&mut hyps, 1, -2.0);
            run(&mut hyps, &[2, 3], &[-3.0, -4.0]);
            hyps.item(0).is_done()
        };
        // -3.0 over one token cannot beat -2.0, over 19 tokens it can
        assert!(outcome(EarlyStopping::Off));
        assert!(!outcome(EarlyStopping::Never));
    }

    #[test]
    fn test_done_bound_includes_diversity_bonus() {
        let done = |diversity_rate| {
            let params = RequestParams::new(0)
                .with_length_penalty(0.0)
                .with_diversity_rate(diversity_rate);
            let mut hyps = setup(2, params, |_| {});
            seed_cba(&mut hyps, 2, -2.0);
            seed_cba(&mut hyps, 2, -2.0);
            let ids = [5, 6, 7, 8, 5, 6, 7, 8];
            let values = [-3.0, -3.5, -9.0, -9.0, -2.5, -9.0, -9.0, -9.0];
            run(&mut hyps, &ids, &values);
            hyps.item(0).is_done()
        };
        // The top candidate ranks at -2.5 + 1.0 once the bonus applies
        assert!(done(0.0));
        assert!(!done(1.0));
    }

    #[test]
    fn test_done_item_is_skipped() {
        let mut hyps = two_beams(RequestParams::new(0));
        hyps.item_mut(0).mark_done();
        run(&mut hyps, &[3, 4, 5, 6, 3, 7, 8, 1], &[-1.0; 8]);
        let item = hyps.item(0);
        assert_eq!(item.beam(0).seq_len, 1);
        assert_eq!(item.beam(0).cum_log_prob, -1.0);
        assert!(item.is_done());
    }

    #[test]
    fn test_diversity_rate_favours_later_beams() {
        let mut hyps = two_beams(RequestParams::new(0).with_diversity_rate(0.5));
        let ids = [3, 4, 5, 6, 7, 8, 2, 1];
        let values = [-1.0, -1.1, -3.0, -4.0, -1.2, -1.3, -5.0, -6.0];
        run(&mut hyps, &ids, &values);

        let item = hyps.item(0);
        // beam 1 candidates compete at -0.7 and -0.8
        assert_eq!(item.beam(0).output_ids()[1], 7);
        assert_eq!(item.beam(0).parent_ids()[1], 1);
        assert_eq!(item.beam(0).cum_log_prob, -1.2);
        assert_eq!(item.beam(1).output_ids()[1], 8);
    }

    #[test]
    fn test_end_token_continues_when_tracking_is_off() {
        let mut hyps = setup(1, RequestParams::new(0), |c| c.track_finished = false);
        run(&mut hyps, &[0, 3], &[-0.1, -2.0]);
        let item = hyps.item(0);
        assert!(item.candidates().is_none());
        assert!(!item.is_done());
        let beam = item.beam(0);
        assert_eq!(beam.output_ids()[1], 0);
        assert_eq!(beam.finished, FinishedState::FinishedEos);
        assert_eq!(beam.seq_len, 2);

        // A finished beam keeps its length on the next step
        run(&mut hyps, &[0, 3], &[-0.1, f32::NEG_INFINITY]);
        assert_eq!(hyps.item(0).beam(0).seq_len, 2);
    }

    #[test]
    fn test_step_log_probs_are_recorded() {
        let mut hyps = setup(2, RequestParams::new(0), |c| c.track_log_probs = true);
        hyps.item_mut(0).beam_mut(0).cum_log_prob = -1.0;
        hyps.item_mut(0).beam_mut(1).cum_log_prob = -2.0;
        let ids = [0, 4, 5, 6, 3, 7, 8, 1];
        let values = [-1.25, -1.5, -3.0, -4.0, -2.5, -2.75, -5.0, -6.0];
        run(&mut hyps, &ids, &values);

        let item = hyps.item(0);
        assert_eq!(item.beam(0).log_probs().unwrap()[1], -0.5);
        assert_eq!(item.beam(1).log_probs().unwrap()[1], -0.5);
        let hyp = item.candidates().unwrap().iter().next().unwrap();
        assert_eq!(hyp.log_probs.as_deref(), Some(&[0.0, -0.25][..]));
    }
}
