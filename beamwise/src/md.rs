//! Online softmax normaliser (the "MD" accumulator).
//!
//! Holds a running maximum `m` and a running sum `d = Σ exp(xᵢ - m)`.
//! Two accumulators merge without revisiting the raw data, so a row can be
//! split across any number of groups and lanes and recombined in any order
//! (see Milakov & Gimelshein, "Online normalizer calculation for softmax").

/// Running `(max, normaliser)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Md {
    /// Running maximum.
    pub m: f32,
    /// Running sum of `exp(x - m)`.
    pub d: f32,
}

impl Default for Md {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Md {
    /// Identity element: combining with it leaves the other side unchanged.
    pub const EMPTY: Self = Self {
        m: -f32::MAX,
        d: 0.0,
    };

    /// Accumulator for a single element.
    #[must_use]
    pub fn single(x: f32) -> Self {
        Self { m: x, d: 1.0 }
    }

    /// Merge two accumulators.
    ///
    /// Commutative exactly, associative up to float rounding.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        let (bigger, smaller) = if self.m > other.m {
            (self, other)
        } else {
            (other, self)
        };
        Self {
            m: bigger.m,
            d: bigger.d + smaller.d * (smaller.m - bigger.m).exp(),
        }
    }

    /// Fold one element into the accumulator.
    pub fn push(&mut self, x: f32) {
        *self = self.combine(Self::single(x));
    }

    /// `log Σ exp(xᵢ)` of everything accumulated so far.
    #[must_use]
    pub fn log_sum_exp(&self) -> f32 {
        self.m + self.d.ln()
    }

    /// Convert a raw score into a log-probability.
    #[must_use]
    pub fn log_prob(&self, x: f32) -> f32 {
        x - self.m - self.d.ln()
    }
}
