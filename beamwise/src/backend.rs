//! Backend trait for the beam search step.
//!
//! A backend owns the three-stage pipeline. The caller owns the
//! [`BeamHypotheses`] state and a backend-specific workspace, and drives one
//! step per generated token:
//!
//! - `top_k_softmax` runs Stages 1 and 2 and leaves `2 * beam_width` scored
//!   candidates per row in the workspace. It only reads the hypotheses.
//! - `finalize_step` runs Stage 3, which takes the hypotheses mutably.
//!
//! Calling the two halves in sequence is the barrier between stages.

use crate::config::BeamSearchConfig;
use crate::hypotheses::BeamHypotheses;
use crate::Result;

/// Scores for one step.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    /// Row-major `[batch_size * beam_width, vocab_size]` scores.
    pub logits: &'a [f32],
    /// Optional `[vocab_size]` bias added to every row.
    pub bias: Option<&'a [f32]>,
}

impl<'a> StepInput<'a> {
    #[must_use]
    pub fn new(logits: &'a [f32]) -> Self {
        Self { logits, bias: None }
    }

    #[must_use]
    pub fn with_bias(mut self, bias: &'a [f32]) -> Self {
        self.bias = Some(bias);
        self
    }
}

/// One beam search step over the current wave of a [`BeamHypotheses`].
pub trait BeamSearchOps {
    /// Intermediate buffers shared between the stages.
    type Workspace: Send;

    /// Allocate a workspace large enough for any wave of `config`.
    fn workspace(&self, config: &BeamSearchConfig) -> Result<Self::Workspace>;

    /// Stages 1 and 2: per-row top `2 * beam_width` log-probabilities plus
    /// the beam's cumulative log-probability.
    fn top_k_softmax(
        &self,
        input: StepInput<'_>,
        hyps: &BeamHypotheses,
        workspace: &mut Self::Workspace,
    ) -> Result<()>;

    /// Stage 3: select next-step beams and update finished candidates.
    fn finalize_step(&self, hyps: &mut BeamHypotheses, workspace: &Self::Workspace) -> Result<()>;

    /// Run a full step.
    fn step(
        &self,
        input: StepInput<'_>,
        hyps: &mut BeamHypotheses,
        workspace: &mut Self::Workspace,
    ) -> Result<()> {
        self.top_k_softmax(input, hyps, workspace)?;
        self.finalize_step(hyps, workspace)
    }
}
