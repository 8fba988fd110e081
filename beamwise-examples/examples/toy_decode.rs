//! Beam search decoding against a synthetic scorer
//!
//! Usage:
//!   cargo run --example toy_decode -- --beam-width 4 --vocab-size 512 --steps 24
//!   # Force the base Stage 1 variant with 16 vocab parts:
//!   cargo run --example toy_decode -- --base --parts 16
//!   # Load sizes from a JSON config:
//!   cargo run --example toy_decode -- --config beam.json
//!   # Show per-stage logs:
//!   RUST_LOG=beamwise_cpu=debug cargo run --example toy_decode

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use beamwise::{
    BeamHypotheses, BeamSearchConfig, BeamSearchOps, EarlyStopping, LaunchConfig, RequestParams,
    Result, StepInput,
};
use beamwise_cpu::CpuBeamSearch;
use beamwise_examples::ToyScorer;

/// Run beam search over a random bigram table and print the best hypotheses.
#[derive(Parser)]
#[command(name = "toy_decode")]
struct Cli {
    /// JSON file with a BeamSearchConfig (overrides the size flags)
    #[arg(short, long, env = "BEAMWISE_CONFIG")]
    config: Option<PathBuf>,

    /// Batch items decoded together
    #[arg(short, long, default_value_t = 2)]
    batch_size: usize,

    /// Beams per batch item
    #[arg(short = 'k', long, default_value_t = 4)]
    beam_width: usize,

    /// Vocabulary size
    #[arg(short, long, default_value_t = 512)]
    vocab_size: usize,

    /// Maximum sequence length, prompt included
    #[arg(long, default_value_t = 64)]
    max_seq_len: usize,

    /// Decoding steps to run
    #[arg(short = 'n', long, default_value_t = 24)]
    steps: usize,

    /// Use the base Stage 1 variant instead of the fast one
    #[arg(long)]
    base: bool,

    /// Vocab parts per row (default: picked from the scratch budget)
    #[arg(short, long)]
    parts: Option<usize>,

    /// Per-group scratch budget in elements
    #[arg(long, default_value_t = 12 * 1024)]
    scratch: usize,

    /// End-of-sequence token id
    #[arg(short, long, default_value_t = 0)]
    end_id: u32,

    /// Length-penalty exponent
    #[arg(short, long, default_value_t = 1.0)]
    length_penalty: f32,

    /// Early stopping flag: 1 = stop when enough, 0 = off, other = never
    #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
    early_stopping: i32,

    /// Diversity rate added per origin beam index
    #[arg(long, default_value_t = 0.0)]
    diversity_rate: f32,

    /// RNG seed for the scorer table
    #[arg(short, long, default_value_t = 42)]
    seed: u64,
}

fn build_config(cli: &Cli) -> Result<BeamSearchConfig> {
    if let Some(path) = &cli.config {
        return BeamSearchConfig::from_file(path);
    }
    let mut config = BeamSearchConfig::new(
        cli.batch_size,
        cli.beam_width,
        cli.vocab_size,
        cli.max_seq_len,
    );
    let rows = cli.batch_size * cli.beam_width;
    config.launch = match (cli.parts, cli.base) {
        (Some(parts), true) => LaunchConfig::base(parts),
        (Some(parts), false) => LaunchConfig::fast(parts, cli.scratch),
        (None, true) => LaunchConfig {
            variant: beamwise::Stage1Variant::Base,
            ..LaunchConfig::select(cli.vocab_size, rows, cli.scratch)?
        },
        (None, false) => LaunchConfig::select(cli.vocab_size, rows, cli.scratch)?,
    };
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    info!(
        batch = config.max_batch_size,
        beam_width = config.beam_width,
        vocab = config.vocab_size,
        variant = ?config.launch.variant,
        parts = config.launch.n_vocab_parts,
        "starting toy decode"
    );

    let backend = CpuBeamSearch::from_config(&config);
    let mut workspace = backend.workspace(&config)?;
    let mut hyps = BeamHypotheses::new(&config)?;
    let scorer = ToyScorer::new(config.vocab_size, cli.end_id, cli.seed);

    let params = RequestParams::new(cli.end_id)
        .with_length_penalty(cli.length_penalty)
        .with_early_stopping(EarlyStopping::from_flag(cli.early_stopping))
        .with_diversity_rate(cli.diversity_rate);
    let prompt_len = 2;
    for slot in 0..config.max_batch_size {
        // Distinct two-token prompts per slot
        #[allow(clippy::cast_possible_truncation)]
        let prompt = [slot, slot + 1].map(|t| (t % config.vocab_size) as u32);
        hyps.start_request(slot, params, &prompt)?;
    }

    let max_steps = cli.steps.min(config.max_seq_len - prompt_len);
    let start = Instant::now();
    let mut steps_run = 0;
    for _ in 0..max_steps {
        if hyps.wave_done() {
            break;
        }
        let logits = scorer.logits(&hyps);
        let input = StepInput::new(&logits);
        backend.step(input, &mut hyps, &mut workspace)?;
        steps_run += 1;
    }
    let elapsed = start.elapsed();
    info!(steps = steps_run, ?elapsed, "decode finished");

    for slot in 0..config.max_batch_size {
        for (rank, hyp) in hyps.finalize(slot, backend.penalty()).iter().enumerate() {
            let line = serde_json::json!({
                "slot": slot,
                "rank": rank,
                "finished": hyp.finished,
                "normed_score": hyp.normed_score,
                "cum_log_prob": hyp.cum_log_prob,
                "tokens": hyp.output_ids,
            });
            println!("{line}");
        }
    }
    Ok(())
}
