//! Length-normalised scoring of beam hypotheses.
//!
//! The finalisation stage never hard-codes a formula: it asks a
//! [`LengthPenalty`] for the normalised score of a finished candidate and
//! for the best score a live beam could still reach.

use crate::config::EarlyStopping;

/// Pure scoring functions used by beam finalisation.
pub trait LengthPenalty: Send + Sync {
    /// Normalised score of a hypothesis with cumulative log-probability
    /// `cum_log_prob` and `length` generated tokens.
    ///
    /// Must be monotonically increasing in `cum_log_prob` for a fixed length.
    fn normalize(&self, cum_log_prob: f32, length: usize, exponent: f32) -> f32;

    /// Best normalised score any continuation of the current best live beam
    /// could still reach.
    ///
    /// With [`EarlyStopping::Never`] and a positive exponent, longer
    /// sequences are rewarded, so the projection uses the longest length
    /// still possible. Otherwise the current length is used.
    fn best_attainable(
        &self,
        best_cum_log_prob: f32,
        current_length: usize,
        max_length: usize,
        exponent: f32,
        early_stopping: EarlyStopping,
    ) -> f32 {
        let length = if early_stopping == EarlyStopping::Never && exponent > 0.0 {
            max_length
        } else {
            current_length
        };
        self.normalize(best_cum_log_prob, length, exponent)
    }
}

/// `cum_log_prob / length^exponent`; an exponent of zero disables the penalty.
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerPenalty;

impl LengthPenalty for PowerPenalty {
    #[allow(clippy::cast_precision_loss)]
    fn normalize(&self, cum_log_prob: f32, length: usize, exponent: f32) -> f32 {
        if exponent == 0.0 {
            return cum_log_prob;
        }
        let length = length.max(1) as f32;
        cum_log_prob / length.powf(exponent)
    }
}

impl<F> LengthPenalty for F
where
    F: Fn(f32, usize, f32) -> f32 + Send + Sync,
{
    fn normalize(&self, cum_log_prob: f32, length: usize, exponent: f32) -> f32 {
        self(cum_log_prob, length, exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_exponent_is_identity() {
        assert_eq!(PowerPenalty.normalize(-3.25, 17, 0.0), -3.25);
    }

    #[test]
    fn test_unit_exponent_is_mean_log_prob() {
        let s = PowerPenalty.normalize(-6.0, 4, 1.0);
        assert!((s - -1.5).abs() < 1e-6);
    }

    #[test]
    fn test_zero_length_does_not_divide_by_zero() {
        let s = PowerPenalty.normalize(-2.0, 0, 1.0);
        assert!((s - -2.0).abs() < 1e-6);
    }

    #[test]
    fn test_monotonic_in_log_prob() {
        for len in [1usize, 3, 10] {
            for exp in [0.0f32, 0.5, 1.0, 2.0] {
                let lo = PowerPenalty.normalize(-5.0, len, exp);
                let hi = PowerPenalty.normalize(-1.0, len, exp);
                assert!(hi > lo, "len={len} exp={exp}");
            }
        }
    }

    #[test]
    fn test_best_attainable_projection() {
        // Never + positive exponent projects to the maximum length
        let never = PowerPenalty.best_attainable(-8.0, 2, 8, 1.0, EarlyStopping::Never);
        assert!((never - -1.0).abs() < 1e-6);

        // Off uses the current length
        let off = PowerPenalty.best_attainable(-8.0, 2, 8, 1.0, EarlyStopping::Off);
        assert!((off - -4.0).abs() < 1e-6);

        // Never with a non-positive exponent also uses the current length
        let flat = PowerPenalty.best_attainable(-8.0, 2, 8, -1.0, EarlyStopping::Never);
        assert!((flat - -16.0).abs() < 1e-5);
    }

    #[test]
    fn test_closure_penalty() {
        let penalty = |cum: f32, len: usize, _exp: f32| cum - len as f32;
        assert_eq!(penalty.normalize(1.0, 3, 0.0), -2.0);
        assert_eq!(
            penalty.best_attainable(1.0, 3, 9, 1.0, EarlyStopping::Never),
            -8.0
        );
    }
}
