//! Repeated extremum extraction with invalidation.
//!
//! The selection loops of every stage share one shape: a group of lanes each
//! hold the best entry of the slots they own; the group reduces those
//! partials to one winner, the winning slot is invalidated, and only the lane
//! that owned it rescans its slots before the next round. [`Extractor`] is
//! that loop, parameterised over the slot type and the "beats" relation.
//!
//! Invalidation takes the value out of its slot (`Option::take`) instead of
//! overwriting it with a sentinel score, so genuine `-inf` entries are never
//! confused with already-extracted ones.

/// How slots are distributed over lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneLayout {
    /// Slot `i` belongs to lane `i % lanes` (a block striding over memory).
    Strided { lanes: usize },
    /// Slot `i` belongs to lane `i / chunk` (one lane per packed tile).
    Chunked { chunk: usize },
}

impl LaneLayout {
    fn lane_count(self, len: usize) -> usize {
        match self {
            Self::Strided { lanes } => lanes.min(len),
            Self::Chunked { chunk } => len.div_ceil(chunk),
        }
    }

    fn lane_of(self, slot: usize) -> usize {
        match self {
            Self::Strided { lanes } => slot % lanes,
            Self::Chunked { chunk } => slot / chunk,
        }
    }

    fn slots(self, lane: usize, len: usize) -> std::iter::StepBy<std::ops::Range<usize>> {
        match self {
            Self::Strided { lanes } => (lane..len).step_by(lanes),
            Self::Chunked { chunk } => (lane * chunk..((lane + 1) * chunk).min(len)).step_by(1),
        }
    }
}

/// Lane-partitioned arg-max extractor over a set of optional slots.
///
/// `beats(a, b)` must be a strict "ranks before" relation. When neither side
/// beats the other the lower slot index wins, so extraction order is fully
/// determined by the slot contents.
pub struct Extractor<T, F> {
    slots: Vec<Option<T>>,
    layout: LaneLayout,
    lane_best: Vec<Option<usize>>,
    beats: F,
}

impl<T, F> Extractor<T, F>
where
    F: Fn(&T, &T) -> bool,
{
    /// Build the extractor and compute every lane's initial partial.
    ///
    /// # Panics
    /// Panics if the layout has zero lanes or a zero chunk size.
    pub fn new(slots: Vec<Option<T>>, layout: LaneLayout, beats: F) -> Self {
        match layout {
            LaneLayout::Strided { lanes } => assert!(lanes > 0, "lane count must be > 0"),
            LaneLayout::Chunked { chunk } => assert!(chunk > 0, "chunk size must be > 0"),
        }
        let mut extractor = Self {
            lane_best: Vec::new(),
            slots,
            layout,
            beats,
        };
        let lanes = layout.lane_count(extractor.slots.len());
        extractor.lane_best = (0..lanes).map(|lane| extractor.scan_lane(lane)).collect();
        extractor
    }

    /// Whether slot `a` wins against slot `b`. Empty slots never win.
    fn wins(&self, a: usize, b: usize) -> bool {
        match (&self.slots[a], &self.slots[b]) {
            (Some(x), Some(y)) => (self.beats)(x, y) || (!(self.beats)(y, x) && a < b),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn scan_lane(&self, lane: usize) -> Option<usize> {
        let mut best: Option<usize> = None;
        for slot in self.layout.slots(lane, self.slots.len()) {
            if self.slots[slot].is_none() {
                continue;
            }
            best = match best {
                Some(current) if !self.wins(slot, current) => Some(current),
                _ => Some(slot),
            };
        }
        best
    }

    /// Pop the best remaining slot, returning its index and value.
    ///
    /// Returns `None` once every slot has been extracted.
    pub fn pop(&mut self) -> Option<(usize, T)> {
        let mut winner: Option<usize> = None;
        for &candidate in self.lane_best.iter().flatten() {
            winner = match winner {
                Some(current) if !self.wins(candidate, current) => Some(current),
                _ => Some(candidate),
            };
        }
        let slot = winner?;
        let value = self.slots[slot].take()?;
        let lane = self.layout.lane_of(slot);
        self.lane_best[lane] = self.scan_lane(lane);
        Some((slot, value))
    }

    /// Return the slot storage so the caller can reuse its allocation.
    pub fn into_slots(self) -> Vec<Option<T>> {
        self.slots
    }
}

/// Extract up to `k` best items in ranking order as `(index, item)` pairs.
pub fn extract_top_k<T, F>(
    items: impl IntoIterator<Item = T>,
    k: usize,
    layout: LaneLayout,
    beats: F,
) -> Vec<(usize, T)>
where
    F: Fn(&T, &T) -> bool,
{
    let slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut extractor = Extractor::new(slots, layout, beats);
    let top = std::iter::from_fn(|| extractor.pop()).take(k).collect();
    top
}
