// cyclevae: train and evaluate a cycle-consistent VAE on paired sprites.
//
// Commands:
//   cyclevae train [--tier TIER] [--config FILE] [--resume CKPT]   Dual-cycle training
//   cyclevae eval  --checkpoint CKPT [--split test]                Held-out cycle losses
//
// Tiers: test (tiny, CPU), default (batch 16, 100 epochs, cuda:0 when built with --features cuda)
// Logging: RUST_LOG (default "info")

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use cyclevae::config::{DeviceChoice, TrainConfig};
use cyclevae::cycle::DualCycleTrainer;
use cyclevae::data::{BatchCursor, DirectorySource};
use cyclevae::sinks::{LossHistory, PngGridWriter};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(author, version, about = "Cycle-consistent VAE trainer for paired sprites")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train encoder and decoder with the forward and reverse cycles.
    Train {
        #[command(flatten)]
        common: CommonArgs,
        /// Override the number of epochs.
        #[arg(long)]
        epochs: Option<usize>,
        /// Continue from a checkpoint at the epoch after the one it holds.
        #[arg(long)]
        resume: Option<PathBuf>,
    },
    /// Report cycle losses on a split without updating parameters.
    Eval {
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long, default_value = "test")]
        split: String,
        /// Iterations to average over; defaults to one pass over the split.
        #[arg(long)]
        iterations: Option<usize>,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    #[arg(long, value_enum, default_value_t = ConfigTier::Default)]
    tier: ConfigTier,
    /// JSON object of TrainConfig fields; missing fields keep the `--tier` values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Root holding `train/` and `test/` sample directories.
    #[arg(long)]
    data: Option<PathBuf>,
    /// `cpu`, `cuda` or `cuda:N`.
    #[arg(long)]
    device: Option<DeviceChoice>,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum ConfigTier {
    Test,
    Default,
}

impl ConfigTier {
    fn train_config(self) -> TrainConfig {
        match self {
            Self::Test => TrainConfig::test(),
            Self::Default => TrainConfig::default(),
        }
    }
}

impl CommonArgs {
    /// Tier defaults, then the JSON file, then command-line overrides.
    fn resolve(&self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_json_file(path, &self.tier.train_config())?,
            None => self.tier.train_config(),
        };
        if let Some(data) = &self.data {
            config.data_dir = data.clone();
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Train {
            common,
            epochs,
            resume,
        } => cmd_train(&common, epochs, resume),
        Command::Eval {
            common,
            checkpoint,
            split,
            iterations,
        } => cmd_eval(&common, checkpoint, &split, iterations),
    };

    if let Err(e) = result {
        eprintln!("[cyclevae] Error: {:#}", e);
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_train(common: &CommonArgs, epochs: Option<usize>, resume: Option<PathBuf>) -> Result<()> {
    let mut config = common.resolve()?;
    if let Some(epochs) = epochs {
        config.num_epochs = epochs;
    }
    let device = config.device.resolve();

    tracing::info!(
        batch_size = config.batch_size,
        epochs = config.num_epochs,
        lr = config.learning_rate,
        z_dim = config.z_dim,
        s_dim = config.s_dim,
        "config"
    );

    let source = DirectorySource::open(&config.data_dir, "train", &device)?;
    let mut cursor = BatchCursor::new(source, config.batch_size, config.seed)?;

    let mut grids = PngGridWriter::new(&config.images_dir, config.grid_rows, config.grid_cols);
    let mut history = LossHistory::new(
        config
            .figures_dir
            .join(format!("{}_history.jsonl", config.run_name)),
    )
    .with_chart(config.figures_dir.join(format!("{}.png", config.run_name)));

    let mut trainer = DualCycleTrainer::new(config, device)?;
    if let Some(path) = resume {
        anyhow::ensure!(path.exists(), "Cannot resume: {} not found", path.display());
        trainer.resume_from(&path)?;
    }

    let losses = trainer.fit(&mut cursor, &mut grids, &mut history)?;
    match losses.last() {
        Some(last) => tracing::info!(
            epoch = last.epoch,
            kl = last.kl_divergence_error,
            reconstruction = last.reconstruction_error,
            reverse_cycle = last.reverse_cycle_loss,
            "training finished"
        ),
        None => tracing::warn!(
            start_epoch = trainer.start_epoch(),
            "nothing to train, checkpoint already covers every epoch"
        ),
    }
    Ok(())
}

fn cmd_eval(
    common: &CommonArgs,
    checkpoint: PathBuf,
    split: &str,
    iterations: Option<usize>,
) -> Result<()> {
    let config = common.resolve()?;
    let device = config.device.resolve();

    let source = DirectorySource::open(&config.data_dir, split, &device)?;
    let mut cursor = BatchCursor::new(source, config.batch_size, config.seed)?;
    let iterations = iterations.unwrap_or_else(|| cursor.batches_per_pass());

    let mut trainer = DualCycleTrainer::new(config, device)?;
    trainer.resume_from(&checkpoint)?;
    let losses = trainer.evaluate(&mut cursor, iterations)?;

    println!("{}", serde_json::to_string_pretty(&losses)?);
    Ok(())
}
