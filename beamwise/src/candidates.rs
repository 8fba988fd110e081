//! Finished-candidate buffer (CBA).
//!
//! Each batch item owns one buffer of `2 * beam_width` slots. Finished
//! hypotheses are admitted until `beam_width` slots are occupied; after that
//! a newcomer must beat the worst held score and replaces it in place.

/// One finished hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedHypothesis {
    /// Full token history, prompt included, ending with the end token.
    pub output_ids: Vec<u32>,
    /// Cumulative log-probability of the generated tokens.
    pub cum_log_prob: f32,
    /// Length-penalty-normalised score used for ranking.
    pub normed_score: f32,
    /// Per-step log-probabilities aligned with `output_ids`, if tracked.
    pub log_probs: Option<Vec<f32>>,
}

impl FinishedHypothesis {
    /// Sequence length including the end token.
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.output_ids.len()
    }
}

/// Fixed-capacity store of finished hypotheses for one batch item.
#[derive(Debug, Clone)]
pub struct CandidateBuffer {
    slots: Vec<Option<FinishedHypothesis>>,
    count: usize,
    min_normed_score: f32,
}

impl CandidateBuffer {
    /// Empty buffer sized for `beam_width` beams.
    #[must_use]
    pub fn new(beam_width: usize) -> Self {
        Self {
            slots: vec![None; 2 * beam_width],
            count: 0,
            min_normed_score: f32::MAX,
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Worst normalised score currently held (`f32::MAX` when empty).
    #[must_use]
    pub fn min_normed_score(&self) -> f32 {
        self.min_normed_score
    }

    /// Whether a newcomer must evict to get in.
    #[must_use]
    pub fn is_full(&self, beam_width: usize) -> bool {
        self.count >= beam_width
    }

    /// Whether a hypothesis with `score` would be admitted.
    #[must_use]
    pub fn admits(&self, beam_width: usize, score: f32) -> bool {
        !self.is_full(beam_width) || score > self.min_normed_score
    }

    /// Occupied slots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &FinishedHypothesis> {
        self.slots.iter().flatten()
    }

    /// Admit a hypothesis, evicting the worst entry when `beam_width` slots
    /// are already occupied.
    ///
    /// Returns `Err(hyp)` unchanged if the buffer is full and `hyp` does not
    /// beat the current minimum; otherwise returns the evicted entry, if any.
    ///
    /// # Errors
    /// Hands the hypothesis back when it is not admitted.
    pub fn insert(
        &mut self,
        beam_width: usize,
        hyp: FinishedHypothesis,
    ) -> std::result::Result<Option<FinishedHypothesis>, FinishedHypothesis> {
        if !self.admits(beam_width, hyp.normed_score) {
            return Err(hyp);
        }
        let evicted = if self.is_full(beam_width) {
            let worst = self.worst_slot();
            self.count -= 1;
            worst.and_then(|slot| self.slots[slot].take())
        } else {
            None
        };
        let Some(free) = self.slots.iter().position(Option::is_none) else {
            return Err(hyp);
        };
        self.slots[free] = Some(hyp);
        self.count += 1;
        self.recompute_min();
        Ok(evicted)
    }

    /// Drop every entry.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.count = 0;
        self.min_normed_score = f32::MAX;
    }

    /// Lowest-index slot holding the minimum score.
    fn worst_slot(&self) -> Option<usize> {
        let mut worst: Option<(usize, f32)> = None;
        for (i, hyp) in self.slots.iter().enumerate() {
            if let Some(hyp) = hyp {
                if worst.map_or(true, |(_, s)| hyp.normed_score < s) {
                    worst = Some((i, hyp.normed_score));
                }
            }
        }
        worst.map(|(i, _)| i)
    }

    fn recompute_min(&mut self) {
        self.min_normed_score = self
            .iter()
            .map(|hyp| hyp.normed_score)
            .fold(f32::MAX, f32::min);
    }
}
