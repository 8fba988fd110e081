//! Shared helpers for the beamwise examples.

use beamwise::BeamHypotheses;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Synthetic bigram scorer standing in for a model forward pass.
///
/// Scores depend only on the previous token, plus a bonus on the end token
/// that grows with the number of generated tokens so that beams eventually
/// finish.
#[derive(Debug, Clone)]
pub struct ToyScorer {
    vocab_size: usize,
    end_id: u32,
    end_bonus_per_step: f32,
    table: Vec<f32>,
}

impl ToyScorer {
    #[must_use]
    pub fn new(vocab_size: usize, end_id: u32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let table = (0..vocab_size * vocab_size)
            .map(|_| rng.gen_range(-4.0..4.0))
            .collect();
        Self {
            vocab_size,
            end_id,
            end_bonus_per_step: 0.5,
            table,
        }
    }

    #[must_use]
    pub fn with_end_bonus(mut self, end_bonus_per_step: f32) -> Self {
        self.end_bonus_per_step = end_bonus_per_step;
        self
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Fill `out` with the scores following `last_token`.
    #[allow(clippy::cast_precision_loss)]
    pub fn score_row(&self, last_token: u32, generated: usize, out: &mut [f32]) {
        let last = last_token as usize % self.vocab_size;
        out.copy_from_slice(&self.table[last * self.vocab_size..(last + 1) * self.vocab_size]);
        out[self.end_id as usize] += self.end_bonus_per_step * generated as f32;
    }

    /// Score matrix for the current wave of `hyps`, one row per beam.
    #[must_use]
    pub fn logits(&self, hyps: &BeamHypotheses) -> Vec<f32> {
        let mut logits = vec![0.0; hyps.rows() * self.vocab_size];
        for (row, out) in logits.chunks_exact_mut(self.vocab_size).enumerate() {
            let (_, beam) = hyps.row(row);
            let last = beam.output_ids()[beam.seq_len.saturating_sub(1)];
            self.score_row(last, beam.generated_len(), out);
        }
        logits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamwise::{BeamSearchConfig, RequestParams};

    #[test]
    fn test_logits_shape_and_determinism() {
        let config = BeamSearchConfig::new(2, 3, 16, 8);
        let mut hyps = BeamHypotheses::new(&config).unwrap();
        hyps.start_request(0, RequestParams::new(0), &[4]).unwrap();
        hyps.start_request(1, RequestParams::new(0), &[5]).unwrap();
        let scorer = ToyScorer::new(16, 0, 1);
        let a = scorer.logits(&hyps);
        assert_eq!(a.len(), 2 * 3 * 16);
        assert_eq!(a, ToyScorer::new(16, 0, 1).logits(&hyps));
        // Beams of one slot share a prompt, so their rows match
        assert_eq!(a[..16], a[16..32]);
        assert_ne!(a[..16], a[48..64]);
    }

    #[test]
    fn test_end_bonus_grows_with_length() {
        let scorer = ToyScorer::new(8, 2, 3).with_end_bonus(1.0);
        let mut early = vec![0.0; 8];
        let mut late = vec![0.0; 8];
        scorer.score_row(5, 0, &mut early);
        scorer.score_row(5, 4, &mut late);
        assert!((late[2] - early[2] - 4.0).abs() < 1e-6);
        assert_eq!(early[3], late[3]);
    }
}
