//! Stage 1: partitioned score reduction.
//!
//! Each row's vocabulary is cut into `n_vocab_parts` contiguous slices and
//! every (row, slice) pair is handled by one execution group (one rayon
//! task). A group streams its slice once and writes a packed tile: the
//! slice's top `2K` `(id, value)` pairs in ranking order plus its [`Md`].
//!
//! The base variant keeps a [`TopK`] per lane and merges them by tree
//! reduction. The fast variant copies the slice into group scratch and reads
//! the top `2K` off it by repeated extraction. Both traverse and reduce the
//! softmax accumulator the same way and rank by the same total order, so
//! their tiles are bit-identical.

use std::ops::Range;

use beamwise::{ranks_before, Extractor, LaneLayout, LaunchConfig, Md, Stage1Variant, TopK};
use rayon::prelude::*;

use crate::lanes::{stream_lanes, tree_reduce};
use crate::workspace::{TileBuffer, TileMut, INVALID_ID};

/// Where a row's scores come from.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RowSource<'a> {
    /// The beam already finished: only the end token may continue it.
    Finished { end_id: u32 },
    /// `logits[i] + bias[i]`.
    Live {
        logits: &'a [f32],
        bias: Option<&'a [f32]>,
    },
}

impl RowSource<'_> {
    #[inline]
    fn value(&self, i: usize) -> f32 {
        match *self {
            Self::Finished { end_id } => {
                if i == end_id as usize {
                    f32::MAX
                } else {
                    -f32::MAX
                }
            }
            Self::Live { logits, bias } => logits[i] + bias.map_or(0.0, |b| b[i]),
        }
    }
}

fn slice_range(part: usize, slice_len: usize, vocab_size: usize) -> Range<usize> {
    let start = (part * slice_len).min(vocab_size);
    start..(start + slice_len).min(vocab_size)
}

fn write_tile(tile: TileMut<'_>, entries: impl Iterator<Item = (f32, u32)>, md: Md) {
    let mut written = 0;
    let dst = tile.values.iter_mut().zip(tile.ids.iter_mut());
    for ((value, id), (dst_v, dst_id)) in entries.zip(dst) {
        *dst_v = value;
        *dst_id = id;
        written += 1;
    }
    tile.values[written..].fill(f32::NEG_INFINITY);
    tile.ids[written..].fill(INVALID_ID);
    *tile.md = md;
}

#[allow(clippy::cast_possible_truncation)]
fn base_group(source: &RowSource<'_>, range: Range<usize>, lanes: usize, tile: TileMut<'_>) {
    let k2 = tile.ids.len();
    let start = range.start;
    let partials = stream_lanes(
        range.len(),
        lanes,
        || (Md::EMPTY, TopK::new(k2)),
        |acc: &mut (Md, TopK), i| {
            let v = source.value(start + i);
            acc.0.push(v);
            acc.1.insert(v, (start + i) as u32);
        },
    );
    let merge = |(ma, ta): (Md, TopK), (mb, tb): (Md, TopK)| (ma.combine(mb), ta.merge(&tb));
    let (md, topk) = tree_reduce(partials, merge).unwrap_or_else(|| (Md::EMPTY, TopK::new(k2)));
    write_tile(tile, topk.iter(), md);
}

#[allow(clippy::cast_possible_truncation)]
fn fast_group(
    source: &RowSource<'_>,
    range: Range<usize>,
    lanes: usize,
    scratch: &mut Vec<Option<(f32, u32)>>,
    tile: TileMut<'_>,
) {
    let k2 = tile.ids.len();
    let mut slots = std::mem::take(scratch);
    slots.clear();
    slots.extend(range.map(|i| Some((source.value(i), i as u32))));

    let accumulate = |md: &mut Md, i: usize| {
        if let Some((v, _)) = slots[i] {
            md.push(v);
        }
    };
    let partials = stream_lanes(slots.len(), lanes, || Md::EMPTY, accumulate);
    let md = tree_reduce(partials, Md::combine).unwrap_or(Md::EMPTY);

    let beats = |a: &(f32, u32), b: &(f32, u32)| ranks_before(a.0, a.1, b.0, b.1);
    let mut extractor = Extractor::new(slots, LaneLayout::Strided { lanes }, beats);
    let top: Vec<(f32, u32)> = std::iter::from_fn(|| extractor.pop())
        .take(k2)
        .map(|(_, entry)| entry)
        .collect();
    *scratch = extractor.into_slots();
    write_tile(tile, top.into_iter(), md);
}

/// Run Stage 1 for `sources.len()` rows into the first rows of `tiles`.
pub(crate) fn run(
    launch: &LaunchConfig,
    sources: &[RowSource<'_>],
    vocab_size: usize,
    tiles: &mut TileBuffer,
) {
    let parts = tiles.n_parts();
    let k2 = tiles.tile_len();
    let slice_len = launch.slice_len(vocab_size);
    let lanes = launch.lanes_per_group;
    let (ids, values, md) = tiles.rows_mut(sources.len());

    let groups = ids
        .par_chunks_mut(k2)
        .zip(values.par_chunks_mut(k2))
        .zip(md.par_iter_mut())
        .enumerate();

    match launch.variant {
        Stage1Variant::Base => groups.for_each(|(t, ((ids, values), md))| {
            let range = slice_range(t % parts, slice_len, vocab_size);
            let tile = TileMut { ids, values, md };
            base_group(&sources[t / parts], range, lanes, tile);
        }),
        Stage1Variant::Fast => groups.for_each_init(Vec::new, |scratch, (t, ((ids, values), md))| {
            let range = slice_range(t % parts, slice_len, vocab_size);
            let tile = TileMut { ids, values, md };
            fast_group(&sources[t / parts], range, lanes, scratch, tile);
        }),
    }
}
