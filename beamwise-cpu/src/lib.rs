//! CPU backend for Beamwise.
//!
//! Runs the three-stage beam search step on the host. Execution groups,
//! rows and batch items map to rayon tasks; the lanes inside a group are
//! simulated in a fixed order, so results do not depend on the thread pool
//! size. Each stage is a separate parallel pass and returns before the next
//! one starts.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

mod lanes;
mod stage1;
mod stage2;
mod stage3;
pub mod workspace;

use beamwise::{
    BeamHypotheses, BeamSearchConfig, BeamSearchOps, Error, LaunchConfig, LengthPenalty,
    PowerPenalty, Result, StepInput,
};
use rayon::prelude::*;
use tracing::debug;

use crate::stage1::RowSource;

pub use workspace::{CpuWorkspace, Tile, TileBuffer, INVALID_ID};

/// Beam search step on the CPU.
///
/// Generic over the length penalty used by Stage 3; [`PowerPenalty`] by
/// default.
#[derive(Debug, Clone)]
pub struct CpuBeamSearch<P = PowerPenalty> {
    launch: LaunchConfig,
    penalty: P,
}

impl CpuBeamSearch {
    #[must_use]
    pub fn new(launch: LaunchConfig) -> Self {
        Self {
            launch,
            penalty: PowerPenalty,
        }
    }

    /// Backend using the launch settings of `config`.
    #[must_use]
    pub fn from_config(config: &BeamSearchConfig) -> Self {
        Self::new(config.launch)
    }
}

impl<P: LengthPenalty> CpuBeamSearch<P> {
    #[must_use]
    pub fn with_penalty(launch: LaunchConfig, penalty: P) -> Self {
        Self { launch, penalty }
    }

    pub fn launch(&self) -> &LaunchConfig {
        &self.launch
    }

    pub fn penalty(&self) -> &P {
        &self.penalty
    }
}

impl<P: LengthPenalty> BeamSearchOps for CpuBeamSearch<P> {
    type Workspace = CpuWorkspace;

    fn workspace(&self, config: &BeamSearchConfig) -> Result<CpuWorkspace> {
        let config = BeamSearchConfig {
            launch: self.launch,
            ..config.clone()
        };
        CpuWorkspace::new(&config)
    }

    fn top_k_softmax(
        &self,
        input: StepInput<'_>,
        hyps: &BeamHypotheses,
        workspace: &mut CpuWorkspace,
    ) -> Result<()> {
        let vocab_size = hyps.vocab_size();
        let rows = hyps.rows();
        self.launch.validate(vocab_size)?;
        let n_parts = self.launch.n_vocab_parts;
        workspace.check(rows, hyps.beam_width(), n_parts)?;
        if input.logits.len() != rows * vocab_size {
            return Err(Error::ShapeMismatch {
                expected: vec![rows, vocab_size],
                got: vec![input.logits.len()],
            });
        }
        if let Some(bias) = input.bias {
            if bias.len() != vocab_size {
                return Err(Error::ShapeMismatch {
                    expected: vec![vocab_size],
                    got: vec![bias.len()],
                });
            }
        }

        let sources: Vec<RowSource<'_>> = input
            .logits
            .chunks_exact(vocab_size)
            .enumerate()
            .map(|(row, logits)| {
                let (item, beam) = hyps.row(row);
                if beam.finished.is_finished() {
                    RowSource::Finished {
                        end_id: item.params.end_id,
                    }
                } else {
                    RowSource::Live {
                        logits,
                        bias: input.bias,
                    }
                }
            })
            .collect();

        debug!(
            rows,
            n_vocab_parts = self.launch.n_vocab_parts,
            variant = ?self.launch.variant,
            "stage 1: partitioned reduction"
        );
        stage1::run(&self.launch, &sources, vocab_size, &mut workspace.tiles);

        let cum_log_probs: Vec<f32> = (0..rows)
            .map(|row| hyps.row(row).1.cum_log_prob)
            .collect();
        debug!(rows, "stage 2: tile merge");
        stage2::run(
            &workspace.tiles,
            &cum_log_probs,
            &mut workspace.candidate_ids,
            &mut workspace.candidate_values,
        );
        workspace.rows = rows;
        Ok(())
    }

    fn finalize_step(&self, hyps: &mut BeamHypotheses, workspace: &CpuWorkspace) -> Result<()> {
        let rows = hyps.rows();
        let bw = hyps.beam_width();
        if workspace.rows() != rows || workspace.beam_width() != bw {
            return Err(Error::ShapeMismatch {
                expected: vec![rows, 2 * bw],
                got: vec![workspace.rows(), 2 * workspace.beam_width()],
            });
        }
        let first_slot = hyps.ite() * hyps.batch_size();
        let max_seq_len = hyps.max_seq_len();
        for (i, item) in hyps.wave().iter().enumerate() {
            if !item.is_done() && item.beams().iter().any(|b| b.seq_len >= max_seq_len) {
                return Err(Error::SequenceFull {
                    slot: first_slot + i,
                    max_seq_len,
                });
            }
        }

        debug!(
            batch_size = hyps.batch_size(),
            beam_width = bw,
            "stage 3: beam finalisation"
        );
        let span = bw * 2 * bw;
        let lanes = self.launch.lanes_per_group;
        let penalty = &self.penalty;
        hyps.wave_mut()
            .par_iter_mut()
            .zip(workspace.candidate_ids[..rows * 2 * bw].par_chunks(span))
            .zip(workspace.candidate_values[..rows * 2 * bw].par_chunks(span))
            .enumerate()
            .for_each(|(i, ((item, ids), values))| {
                stage3::finalize_item(first_slot + i, item, ids, values, penalty, lanes);
            });
        Ok(())
    }
}
