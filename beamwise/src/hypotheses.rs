//! Persistent beam search state.
//!
//! [`BeamHypotheses`] is an arena of batch items, each owning its beams and
//! its finished-candidate buffer. Beams are addressed by index; the token
//! tree of a beam is recovered by following per-step parent indices, never
//! by pointers. Stages 1 and 2 only read this state. Stage 3 takes `&mut`
//! for the duration of one step and mutates each batch item independently.

use crate::candidates::{CandidateBuffer, FinishedHypothesis};
use crate::config::{BeamSearchConfig, RequestParams};
use crate::length_penalty::LengthPenalty;
use crate::{Error, Result};
use tracing::debug;

/// Cumulative log-probability given to beams 1.. at the start of a request,
/// so the first step expands from beam 0 only.
pub const INACTIVE_BEAM_LOG_PROB: f32 = -1e20;

/// Whether a beam still generates tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinishedState {
    #[default]
    NotFinished,
    /// The beam emitted the end token.
    FinishedEos,
    /// The beam was stopped for another reason (its batch item is done).
    Finished,
}

impl FinishedState {
    #[must_use]
    pub fn is_finished(self) -> bool {
        self != Self::NotFinished
    }
}

/// One live beam.
#[derive(Debug, Clone)]
pub struct BeamRecord {
    /// Cumulative log-probability of the generated tokens.
    pub cum_log_prob: f32,
    /// Tokens so far, prompt included.
    pub seq_len: usize,
    pub finished: FinishedState,
    /// Prompt length.
    pub input_len: usize,
    output_ids: Vec<u32>,
    parent_ids: Vec<u32>,
    log_probs: Option<Vec<f32>>,
}

impl BeamRecord {
    fn new(max_seq_len: usize, track_log_probs: bool) -> Self {
        Self {
            cum_log_prob: 0.0,
            seq_len: 0,
            finished: FinishedState::NotFinished,
            input_len: 0,
            output_ids: vec![0; max_seq_len],
            parent_ids: vec![0; max_seq_len],
            log_probs: track_log_probs.then(|| vec![0.0; max_seq_len]),
        }
    }

    /// Token written at each step by whichever hypothesis held this slot.
    #[must_use]
    pub fn output_ids(&self) -> &[u32] {
        &self.output_ids
    }

    /// Beam index each step's token was extended from.
    #[must_use]
    pub fn parent_ids(&self) -> &[u32] {
        &self.parent_ids
    }

    #[must_use]
    pub fn log_probs(&self) -> Option<&[f32]> {
        self.log_probs.as_deref()
    }

    /// Number of tokens generated after the prompt.
    #[must_use]
    pub fn generated_len(&self) -> usize {
        self.seq_len.saturating_sub(self.input_len)
    }

    /// Record the token chosen for this slot at `step`.
    pub fn write_step(&mut self, step: usize, token: u32, parent: u32, log_prob: f32) {
        self.output_ids[step] = token;
        self.parent_ids[step] = parent;
        if let Some(log_probs) = self.log_probs.as_mut() {
            log_probs[step] = log_prob;
        }
    }
}

/// A decoded hypothesis returned by [`BeamHypotheses::finalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub output_ids: Vec<u32>,
    pub cum_log_prob: f32,
    pub normed_score: f32,
    pub log_probs: Option<Vec<f32>>,
    /// Whether the hypothesis ended with the end token.
    pub finished: bool,
}

/// State of one batch item: its request parameters, beams and finished
/// candidates.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub params: RequestParams,
    done: bool,
    beams: Vec<BeamRecord>,
    candidates: Option<CandidateBuffer>,
    max_seq_len: usize,
}

impl BatchItem {
    fn new(config: &BeamSearchConfig) -> Self {
        Self {
            params: RequestParams::new(0),
            done: false,
            beams: (0..config.beam_width)
                .map(|_| BeamRecord::new(config.max_seq_len, config.track_log_probs))
                .collect(),
            candidates: config
                .track_finished
                .then(|| CandidateBuffer::new(config.beam_width)),
            max_seq_len: config.max_seq_len,
        }
    }

    #[must_use]
    pub fn beam_width(&self) -> usize {
        self.beams.len()
    }

    #[must_use]
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Whether this batch item has stopped for the current run.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Mark the batch item done. There is no way to clear the flag short of
    /// starting a new request in this slot.
    pub fn mark_done(&mut self) {
        self.done = true;
    }

    #[must_use]
    pub fn beams(&self) -> &[BeamRecord] {
        &self.beams
    }

    pub fn beams_mut(&mut self) -> &mut [BeamRecord] {
        &mut self.beams
    }

    #[must_use]
    pub fn beam(&self, beam: usize) -> &BeamRecord {
        &self.beams[beam]
    }

    pub fn beam_mut(&mut self, beam: usize) -> &mut BeamRecord {
        &mut self.beams[beam]
    }

    /// Finished-candidate buffer, if tracking is enabled.
    #[must_use]
    pub fn candidates(&self) -> Option<&CandidateBuffer> {
        self.candidates.as_ref()
    }

    pub fn candidates_mut(&mut self) -> Option<&mut CandidateBuffer> {
        self.candidates.as_mut()
    }

    /// Walk parent links back from `beam` and return the first `len` tokens
    /// (and log-probs, if tracked) of its hypothesis.
    #[must_use]
    pub fn gather(&self, beam: usize, len: usize) -> (Vec<u32>, Option<Vec<f32>>) {
        let mut ids = vec![0u32; len];
        let tracked = self.beams[beam].log_probs.is_some();
        let mut log_probs = tracked.then(|| vec![0.0f32; len]);
        let mut prev = beam;
        for j in (0..len).rev() {
            let record = &self.beams[prev];
            ids[j] = record.output_ids[j];
            if let (Some(out), Some(src)) = (log_probs.as_mut(), record.log_probs.as_ref()) {
                out[j] = src[j];
            }
            prev = record.parent_ids[j] as usize;
        }
        (ids, log_probs)
    }

    /// Reconstruct the hypothesis of `beam` ending with the end token at
    /// position `beam.seq_len`.
    #[must_use]
    pub fn finished_hypothesis(
        &self,
        beam: usize,
        cum_log_prob: f32,
        normed_score: f32,
        step_log_prob: f32,
    ) -> FinishedHypothesis {
        let step = self.beams[beam].seq_len;
        let (mut output_ids, mut log_probs) = self.gather(beam, step);
        output_ids.push(self.params.end_id);
        if let Some(log_probs) = log_probs.as_mut() {
            log_probs.push(step_log_prob);
        }
        FinishedHypothesis {
            output_ids,
            cum_log_prob,
            normed_score,
            log_probs,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn start(&mut self, params: RequestParams, prompt: &[u32]) {
        self.params = params;
        self.done = false;
        for (i, beam) in self.beams.iter_mut().enumerate() {
            beam.cum_log_prob = if i == 0 { 0.0 } else { INACTIVE_BEAM_LOG_PROB };
            beam.seq_len = prompt.len();
            beam.input_len = prompt.len();
            beam.finished = FinishedState::NotFinished;
            beam.output_ids.fill(0);
            beam.output_ids[..prompt.len()].copy_from_slice(prompt);
            beam.parent_ids.fill(i as u32);
            if let Some(log_probs) = beam.log_probs.as_mut() {
                log_probs.fill(0.0);
            }
        }
        if let Some(candidates) = self.candidates.as_mut() {
            candidates.reset();
        }
    }
}

/// Beam search state for every batch item of a decoding run.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    beam_width: usize,
    vocab_size: usize,
    max_seq_len: usize,
    batch_size: usize,
    ite: usize,
    items: Vec<BatchItem>,
}

impl BeamHypotheses {
    /// Allocate state sized for `config`. The current wave covers every slot.
    ///
    /// # Errors
    /// Returns an error if `config` fails validation.
    pub fn new(config: &BeamSearchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            beam_width: config.beam_width,
            vocab_size: config.vocab_size,
            max_seq_len: config.max_seq_len,
            batch_size: config.max_batch_size,
            ite: 0,
            items: (0..config.max_batch_size)
                .map(|_| BatchItem::new(config))
                .collect(),
        })
    }

    #[must_use]
    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    #[must_use]
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.items.len()
    }

    /// Batch items covered by one step.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Wave index: the current step covers slots
    /// `ite * batch_size .. (ite + 1) * batch_size`.
    #[must_use]
    pub fn ite(&self) -> usize {
        self.ite
    }

    /// Score rows one step consumes (`batch_size * beam_width`).
    #[must_use]
    pub fn rows(&self) -> usize {
        self.batch_size * self.beam_width
    }

    /// Select which slots the next steps operate on.
    ///
    /// # Errors
    /// Returns an error if `batch_size` is zero or the wave runs past the
    /// last slot.
    pub fn set_wave(&mut self, batch_size: usize, ite: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("wave batch_size must be > 0".into()));
        }
        let end = batch_size * (ite + 1);
        if end > self.items.len() {
            return Err(Error::SlotOutOfRange {
                slot: end - 1,
                max_batch_size: self.items.len(),
            });
        }
        self.batch_size = batch_size;
        self.ite = ite;
        Ok(())
    }

    /// Begin a new request in `slot`, resetting only that slot.
    ///
    /// # Errors
    /// Returns an error if `slot` is out of range, the prompt is empty or
    /// leaves no room to generate, or `end_id` is outside the vocabulary.
    pub fn start_request(
        &mut self,
        slot: usize,
        params: RequestParams,
        prompt: &[u32],
    ) -> Result<()> {
        let max_batch_size = self.items.len();
        if slot >= max_batch_size {
            return Err(Error::SlotOutOfRange {
                slot,
                max_batch_size,
            });
        }
        if prompt.is_empty() || prompt.len() >= self.max_seq_len {
            return Err(Error::InvalidConfig(format!(
                "prompt length {} must be in 1..{}",
                prompt.len(),
                self.max_seq_len
            )));
        }
        if params.end_id as usize >= self.vocab_size {
            return Err(Error::InvalidConfig(format!(
                "end_id {} outside vocabulary of {}",
                params.end_id, self.vocab_size
            )));
        }
        if let Some(token) = prompt.iter().find(|&&t| t as usize >= self.vocab_size) {
            return Err(Error::InvalidConfig(format!(
                "prompt token {token} outside vocabulary of {}",
                self.vocab_size
            )));
        }
        self.items[slot].start(params, prompt);
        debug!(
            slot,
            prompt_len = prompt.len(),
            end_id = params.end_id,
            "request started"
        );
        Ok(())
    }

    #[must_use]
    pub fn item(&self, slot: usize) -> &BatchItem {
        &self.items[slot]
    }

    pub fn item_mut(&mut self, slot: usize) -> &mut BatchItem {
        &mut self.items[slot]
    }

    /// Batch items of the current wave.
    #[must_use]
    pub fn wave(&self) -> &[BatchItem] {
        let start = self.ite * self.batch_size;
        &self.items[start..start + self.batch_size]
    }

    /// Mutable batch items of the current wave.
    pub fn wave_mut(&mut self) -> &mut [BatchItem] {
        let start = self.ite * self.batch_size;
        &mut self.items[start..start + self.batch_size]
    }

    /// The batch item and beam behind score row `row` of the current wave.
    #[must_use]
    pub fn row(&self, row: usize) -> (&BatchItem, &BeamRecord) {
        let item = &self.wave()[row / self.beam_width];
        (item, &item.beams[row % self.beam_width])
    }

    /// Whether every batch item of the current wave is done.
    #[must_use]
    pub fn wave_done(&self) -> bool {
        self.wave()
            .iter()
            .all(|item| item.done || item.beams.iter().all(|b| b.finished.is_finished()))
    }

    /// Best `beam_width` hypotheses of `slot`, best first.
    ///
    /// Finished candidates come from the candidate buffer. If it holds fewer
    /// than `beam_width` entries (or tracking is off) the remaining places
    /// are filled from live beams scored by `penalty` at their current
    /// length.
    #[must_use]
    pub fn finalize(&self, slot: usize, penalty: &dyn LengthPenalty) -> Vec<Hypothesis> {
        let item = &self.items[slot];
        let exponent = item.params.length_penalty;
        let mut out: Vec<Hypothesis> = item
            .candidates()
            .into_iter()
            .flat_map(CandidateBuffer::iter)
            .map(|hyp| Hypothesis {
                output_ids: hyp.output_ids.clone(),
                cum_log_prob: hyp.cum_log_prob,
                normed_score: hyp.normed_score,
                log_probs: hyp.log_probs.clone(),
                finished: true,
            })
            .collect();

        if out.len() < self.beam_width {
            for (i, beam) in item.beams.iter().enumerate() {
                if beam.cum_log_prob <= INACTIVE_BEAM_LOG_PROB {
                    continue;
                }
                let (output_ids, log_probs) = item.gather(i, beam.seq_len);
                out.push(Hypothesis {
                    normed_score: penalty.normalize(
                        beam.cum_log_prob,
                        beam.generated_len(),
                        exponent,
                    ),
                    output_ids,
                    cum_log_prob: beam.cum_log_prob,
                    log_probs,
                    finished: beam.finished == FinishedState::FinishedEos,
                });
            }
        }

        out.sort_by(|a, b| b.normed_score.total_cmp(&a.normed_score));
        out.truncate(self.beam_width);
        out
    }
}
