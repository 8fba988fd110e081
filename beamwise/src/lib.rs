//! Beamwise: partitioned top-K softmax selection for beam search decoding.
//!
//! This crate holds the backend-independent pieces: the online softmax
//! accumulator, the bounded top-K tracker, the extract-with-invalidation
//! primitive, configuration, length penalties and the persistent beam
//! state. Backends (see `beamwise-cpu`) implement [`BeamSearchOps`].

#![allow(clippy::module_name_repetitions, clippy::doc_markdown)]

#[allow(clippy::missing_errors_doc)]
pub mod backend;
pub mod candidates;
pub mod config;
pub mod error;
pub mod extract;
pub mod hypotheses;
pub mod length_penalty;
pub mod md;
pub mod topk;

pub use backend::{BeamSearchOps, StepInput};
pub use candidates::{CandidateBuffer, FinishedHypothesis};
pub use config::{
    BeamSearchConfig, EarlyStopping, LaunchConfig, RequestParams, Stage1Variant, MAX_VOCAB_PARTS,
};
pub use error::{Error, Result};
pub use extract::{extract_top_k, Extractor, LaneLayout};
pub use hypotheses::{
    BatchItem, BeamHypotheses, BeamRecord, FinishedState, Hypothesis, INACTIVE_BEAM_LOG_PROB,
};
pub use length_penalty::{LengthPenalty, PowerPenalty};
pub use md::Md;
pub use topk::{rank_value, ranks_before, TopK};
