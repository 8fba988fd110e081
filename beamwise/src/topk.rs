//! Bounded top-K tracker.
//!
//! A fixed-capacity list of `(value, id)` pairs kept in ranking order. Each
//! lane of an execution group owns one tracker while streaming its share of
//! a vocabulary slice; trackers are then merged pairwise.

/// Value used for ranking. NaN ranks like negative infinity.
#[inline]
#[must_use]
pub fn rank_value(value: f32) -> f32 {
    if value.is_nan() {
        f32::NEG_INFINITY
    } else {
        value
    }
}

/// Whether `(a_value, a_id)` ranks strictly before `(b_value, b_id)`.
///
/// Larger values first; equal values are ordered by ascending id. Every
/// selection path in the crate uses this order so that different reduction
/// shapes agree entry for entry.
#[inline]
#[must_use]
pub fn ranks_before(a_value: f32, a_id: u32, b_value: f32, b_id: u32) -> bool {
    let (a, b) = (rank_value(a_value), rank_value(b_value));
    a > b || (a == b && a_id < b_id)
}

/// Up to `capacity` best `(value, id)` pairs, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct TopK {
    values: Vec<f32>,
    ids: Vec<u32>,
    capacity: usize,
}

impl TopK {
    /// Create an empty tracker.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "TopK capacity must be > 0");
        Self {
            values: Vec::with_capacity(capacity),
            ids: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    #[must_use]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// Iterate `(value, id)` pairs best first.
    pub fn iter(&self) -> impl Iterator<Item = (f32, u32)> + '_ {
        self.values.iter().copied().zip(self.ids.iter().copied())
    }

    /// Insert a pair, dropping the worst entry if the tracker is full.
    ///
    /// A full tracker ignores pairs that do not rank before its last entry.
    pub fn insert(&mut self, value: f32, id: u32) {
        if self.values.len() == self.capacity {
            let last = self.capacity - 1;
            if !ranks_before(value, id, self.values[last], self.ids[last]) {
                return;
            }
            self.values.pop();
            self.ids.pop();
        }
        let pos = self
            .values
            .iter()
            .zip(&self.ids)
            .position(|(&v, &i)| ranks_before(value, id, v, i))
            .unwrap_or(self.values.len());
        self.values.insert(pos, value);
        self.ids.insert(pos, id);
    }

    /// Bounded merge of two trackers into the best `capacity` of their union.
    ///
    /// # Panics
    /// Panics if the capacities differ.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        assert_eq!(
            self.capacity, other.capacity,
            "cannot merge TopK trackers of different capacity"
        );
        let mut out = Self::new(self.capacity);
        let (mut a, mut b) = (0, 0);
        while out.values.len() < out.capacity {
            let take_a = match (a < self.len(), b < other.len()) {
                (false, false) => break,
                (true, false) => true,
                (false, true) => false,
                (true, true) => {
                    ranks_before(self.values[a], self.ids[a], other.values[b], other.ids[b])
                }
            };
            if take_a {
                out.values.push(self.values[a]);
                out.ids.push(self.ids[a]);
                a += 1;
            } else {
                out.values.push(other.values[b]);
                out.ids.push(other.ids[b]);
                b += 1;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pairs(t: &TopK) -> Vec<(f32, u32)> {
        t.iter().collect()
    }

    #[test]
    fn test_insert_keeps_descending_order() {
        let mut t = TopK::new(3);
        for (i, v) in [1.0, 5.0, 2.0, 0.0, 3.0].into_iter().enumerate() {
            t.insert(v, i as u32);
        }
        assert_eq!(pairs(&t), vec![(5.0, 1), (3.0, 4), (2.0, 2)]);
    }

    #[test]
    fn test_insert_below_full_tracker_is_ignored() {
        let mut t = TopK::new(2);
        t.insert(4.0, 0);
        t.insert(3.0, 1);
        t.insert(1.0, 2);
        assert_eq!(pairs(&t), vec![(4.0, 0), (3.0, 1)]);
    }

    #[test]
    fn test_ties_keep_lower_id() {
        let mut t = TopK::new(2);
        t.insert(1.0, 3);
        t.insert(1.0, 5);
        t.insert(1.0, 7);
        assert_eq!(pairs(&t), vec![(1.0, 3), (1.0, 5)]);

        // A lower id with an equal value displaces the later one
        t.insert(1.0, 1);
        assert_eq!(pairs(&t), vec![(1.0, 1), (1.0, 3)]);
    }

    #[test]
    fn test_nan_ranks_last() {
        let mut t = TopK::new(2);
        t.insert(f32::NAN, 0);
        t.insert(-100.0, 1);
        t.insert(f32::NEG_INFINITY, 2);
        assert_eq!(t.ids(), &[1, 0]);
    }

    #[test]
    fn test_merge_takes_best_of_union() {
        let mut a = TopK::new(3);
        let mut b = TopK::new(3);
        for (v, i) in [(9.0, 0), (4.0, 2), (1.0, 4)] {
            a.insert(v, i);
        }
        for (v, i) in [(7.0, 1), (4.0, 3), (0.5, 5)] {
            b.insert(v, i);
        }
        let m = a.merge(&b);
        assert_eq!(pairs(&m), vec![(9.0, 0), (7.0, 1), (4.0, 2)]);
        assert_eq!(m, b.merge(&a));
    }

    #[test]
    fn test_merge_with_partial_trackers() {
        let mut a = TopK::new(4);
        a.insert(2.0, 10);
        let b = TopK::new(4);
        let m = a.merge(&b);
        assert_eq!(pairs(&m), vec![(2.0, 10)]);
        assert_eq!(m.capacity(), 4);
    }

    #[test]
    fn test_matches_sorted_reference() {
        let values: Vec<f32> = (0..50).map(|i| ((i * 37) % 17) as f32).collect();
        let mut t = TopK::new(6);
        for (i, &v) in values.iter().enumerate() {
            t.insert(v, i as u32);
        }
        let mut reference: Vec<(f32, u32)> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i as u32))
            .collect();
        reference.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        reference.truncate(6);
        assert_eq!(pairs(&t), reference);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_merge_equals_single_pass(
            values in proptest::collection::vec(-100.0f32..100.0, 1..200),
            k in 1usize..8,
            split in 0usize..200,
        ) {
            let split = split % values.len();
            let mut whole = TopK::new(k);
            let mut left = TopK::new(k);
            let mut right = TopK::new(k);
            for (i, &v) in values.iter().enumerate() {
                whole.insert(v, i as u32);
                let half = if i < split { &mut left } else { &mut right };
                half.insert(v, i as u32);
            }
            prop_assert_eq!(left.merge(&right), whole);
        }
    }
}
