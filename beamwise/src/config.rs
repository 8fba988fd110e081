//! Beam search configuration.
//!
//! [`BeamSearchConfig`] sizes the decoder state for a whole run and is
//! usually read from a JSON file. [`LaunchConfig`] chooses how Stage 1
//! partitions the vocabulary. [`RequestParams`] carries the per-request
//! knobs (end token, penalties, early stopping).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Upper bound on the number of vocabulary partitions per row.
pub const MAX_VOCAB_PARTS: usize = 128;

/// Which Stage 1 implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage1Variant {
    /// Per-lane top-K trackers merged by tree reduction. Needs no scratch.
    Base,
    /// Copies the slice into group scratch, then extracts by repeated arg-max.
    #[default]
    Fast,
}

/// Vocabulary partitioning for Stage 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Stage 1 implementation.
    #[serde(default)]
    pub variant: Stage1Variant,

    /// Number of contiguous vocabulary slices per row (`nVPart`).
    pub n_vocab_parts: usize,

    /// Cooperating lanes per execution group.
    #[serde(default = "default_lanes_per_group")]
    pub lanes_per_group: usize,

    /// Elements of scratch available to one group (fast variant only).
    #[serde(default = "default_scratch_capacity")]
    pub scratch_capacity: usize,
}

fn default_lanes_per_group() -> usize {
    128
}

fn default_scratch_capacity() -> usize {
    // 48 KiB of f32
    12 * 1024
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            variant: Stage1Variant::Fast,
            n_vocab_parts: 8,
            lanes_per_group: default_lanes_per_group(),
            scratch_capacity: default_scratch_capacity(),
        }
    }
}

impl LaunchConfig {
    /// Base variant with `n_vocab_parts` slices.
    #[must_use]
    pub fn base(n_vocab_parts: usize) -> Self {
        Self {
            variant: Stage1Variant::Base,
            n_vocab_parts,
            ..Self::default()
        }
    }

    /// Fast variant with `n_vocab_parts` slices and the given scratch size.
    #[must_use]
    pub fn fast(n_vocab_parts: usize, scratch_capacity: usize) -> Self {
        Self {
            variant: Stage1Variant::Fast,
            n_vocab_parts,
            scratch_capacity,
            ..Self::default()
        }
    }

    /// Same config with a different lane count.
    #[must_use]
    pub fn with_lanes(mut self, lanes_per_group: usize) -> Self {
        self.lanes_per_group = lanes_per_group;
        self
    }

    /// Pick a launch config from a scratch budget.
    ///
    /// Prefers the fast variant with the fewest slices whose scratch fits.
    /// Falls back to the base variant when even [`MAX_VOCAB_PARTS`] slices
    /// would not fit, spreading small batches over more slices.
    ///
    /// # Errors
    /// Returns an error if `vocab_size`, `rows` or `scratch_capacity` is zero.
    pub fn select(vocab_size: usize, rows: usize, scratch_capacity: usize) -> Result<Self> {
        if vocab_size == 0 || rows == 0 || scratch_capacity == 0 {
            return Err(Error::InvalidConfig(format!(
                "cannot select launch config for vocab_size={vocab_size}, rows={rows}, \
                 scratch_capacity={scratch_capacity}"
            )));
        }
        let fast_parts = vocab_size.div_ceil(scratch_capacity);
        if fast_parts <= MAX_VOCAB_PARTS {
            return Ok(Self::fast(fast_parts, scratch_capacity));
        }
        let base_parts = if rows < 256 {
            240usize.div_ceil(rows).min(MAX_VOCAB_PARTS)
        } else {
            4
        };
        Ok(Self {
            scratch_capacity,
            ..Self::base(base_parts)
        })
    }

    /// Number of vocabulary entries each slice covers.
    #[must_use]
    pub fn slice_len(&self, vocab_size: usize) -> usize {
        vocab_size.div_ceil(self.n_vocab_parts.max(1))
    }

    /// Check that this config can address the whole vocabulary.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for a zero or oversized partition or
    /// lane count, and [`Error::VocabTooLarge`] when the slices cannot cover
    /// `vocab_size` entries.
    pub fn validate(&self, vocab_size: usize) -> Result<()> {
        if self.n_vocab_parts == 0 || self.n_vocab_parts > MAX_VOCAB_PARTS {
            return Err(Error::InvalidConfig(format!(
                "n_vocab_parts must be in 1..={MAX_VOCAB_PARTS}, got {}",
                self.n_vocab_parts
            )));
        }
        if self.lanes_per_group == 0 {
            return Err(Error::InvalidConfig("lanes_per_group must be > 0".into()));
        }
        let too_large = |capacity: usize| Error::VocabTooLarge {
            vocab_size,
            n_vocab_parts: self.n_vocab_parts,
            capacity,
        };
        if u32::try_from(vocab_size).is_err() {
            return Err(too_large(u32::MAX as usize));
        }
        let slice_len = self.slice_len(vocab_size);
        if self.variant == Stage1Variant::Fast && slice_len > self.scratch_capacity {
            return Err(too_large(self.scratch_capacity * self.n_vocab_parts));
        }
        Ok(())
    }
}

/// When a batch item stops accepting new hypotheses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyStopping {
    /// Done once the best live beam cannot beat the worst finished one at
    /// its current length.
    #[default]
    Off,
    /// Done as soon as `beam_width` finished candidates exist.
    Enabled,
    /// Done only when no continuation can ever beat the worst finished one.
    Never,
}

impl EarlyStopping {
    /// Decode the integer flag used by HF-style configs: `1` enables early
    /// stopping, `0` disables it, anything else means "never".
    #[must_use]
    pub fn from_flag(flag: i32) -> Self {
        match flag {
            1 => Self::Enabled,
            0 => Self::Off,
            _ => Self::Never,
        }
    }
}

/// Per-request beam search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    /// End-of-sequence token id.
    pub end_id: u32,

    /// Bonus per origin-beam index added when ranking candidates.
    #[serde(default)]
    pub diversity_rate: f32,

    /// Length-penalty exponent.
    #[serde(default = "default_length_penalty")]
    pub length_penalty: f32,

    #[serde(default)]
    pub early_stopping: EarlyStopping,
}

fn default_length_penalty() -> f32 {
    1.0
}

impl RequestParams {
    #[must_use]
    pub fn new(end_id: u32) -> Self {
        Self {
            end_id,
            diversity_rate: 0.0,
            length_penalty: default_length_penalty(),
            early_stopping: EarlyStopping::Off,
        }
    }

    #[must_use]
    pub fn with_length_penalty(mut self, length_penalty: f32) -> Self {
        self.length_penalty = length_penalty;
        self
    }

    #[must_use]
    pub fn with_early_stopping(mut self, early_stopping: EarlyStopping) -> Self {
        self.early_stopping = early_stopping;
        self
    }

    #[must_use]
    pub fn with_diversity_rate(mut self, diversity_rate: f32) -> Self {
        self.diversity_rate = diversity_rate;
        self
    }
}

/// Sizing and feature switches for one decoding run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamSearchConfig {
    /// Maximum number of batch items held at once.
    pub max_batch_size: usize,

    /// Beams per batch item.
    pub beam_width: usize,

    /// Vocabulary size (row length of the score matrix).
    pub vocab_size: usize,

    /// Maximum sequence length, prompt included.
    pub max_seq_len: usize,

    /// Keep a finished-candidate buffer per batch item.
    #[serde(default = "default_true")]
    pub track_finished: bool,

    /// Record per-step log-probabilities for every beam.
    #[serde(default)]
    pub track_log_probs: bool,

    #[serde(default)]
    pub launch: LaunchConfig,
}

fn default_true() -> bool {
    true
}

impl BeamSearchConfig {
    /// Config with default feature switches and launch settings.
    #[must_use]
    pub fn new(
        max_batch_size: usize,
        beam_width: usize,
        vocab_size: usize,
        max_seq_len: usize,
    ) -> Self {
        Self {
            max_batch_size,
            beam_width,
            vocab_size,
            max_seq_len,
            track_finished: true,
            track_log_probs: false,
            launch: LaunchConfig::default(),
        }
    }

    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if the
    /// parsed config fails [`validate`](Self::validate).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of candidates kept per beam (`2 * beam_width`).
    #[must_use]
    pub fn candidates_per_beam(&self) -> usize {
        2 * self.beam_width
    }

    /// Validate sizes and the launch config.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for zero sizes or a vocabulary with
    /// fewer than `2 * beam_width` entries, and whatever
    /// [`LaunchConfig::validate`] reports.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 || self.beam_width == 0 || self.max_seq_len == 0 {
            return Err(Error::InvalidConfig(format!(
                "max_batch_size, beam_width and max_seq_len must be > 0, got {}, {}, {}",
                self.max_batch_size, self.beam_width, self.max_seq_len
            )));
        }
        if self.vocab_size < self.candidates_per_beam() {
            return Err(Error::InvalidConfig(format!(
                "vocab_size {} is smaller than 2 * beam_width = {}",
                self.vocab_size,
                self.candidates_per_beam()
            )));
        }
        self.launch.validate(self.vocab_size)
    }
}
