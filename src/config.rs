use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::CycleVaeError;

/// Sprites are square RGB rasters of this side length. The encoder's four
/// stride-2 blocks reduce 60 -> 2 and the decoder mirrors that, so the size is
/// fixed by the architecture.
pub const IMAGE_SIZE: usize = 60;
pub const IMAGE_CHANNELS: usize = 3;

// ---------------------------------------------------------------------------
// Device selection
// ---------------------------------------------------------------------------

/// Written `cpu`, `cuda` or `cuda:N`, both on the command line and in JSON.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceChoice {
    Cpu,
    Cuda(usize),
}

impl FromStr for DeviceChoice {
    type Err = CycleVaeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| CycleVaeError::Config(format!("unknown device '{other}'"))),
        }
    }
}

impl fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

impl TryFrom<String> for DeviceChoice {
    type Error = CycleVaeError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceChoice> for String {
    fn from(device: DeviceChoice) -> Self {
        device.to_string()
    }
}

impl DeviceChoice {
    /// Resolve to a candle device. CUDA falls back to CPU when unavailable or
    /// when the crate was built without the `cuda` feature.
    pub fn resolve(self) -> Device {
        match self {
            Self::Cpu => Device::Cpu,
            Self::Cuda(ordinal) => cuda_or_cpu(ordinal),
        }
    }
}

#[cfg(feature = "cuda")]
fn cuda_or_cpu(ordinal: usize) -> Device {
    if !candle_core::utils::cuda_is_available() {
        tracing::warn!("CUDA not available, using CPU");
        return Device::Cpu;
    }
    match Device::new_cuda(ordinal) {
        Ok(dev) => {
            tracing::info!(ordinal, "using CUDA device");
            dev
        }
        Err(e) => {
            tracing::warn!("CUDA init failed, falling back to CPU: {e}");
            Device::Cpu
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn cuda_or_cpu(ordinal: usize) -> Device {
    tracing::warn!(
        ordinal,
        "built without CUDA feature, using CPU (rebuild with --features cuda for GPU)"
    );
    Device::Cpu
}

// ---------------------------------------------------------------------------
// Training config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub num_epochs: usize,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    /// Style (unspecified factor) dimensionality.
    pub z_dim: usize,
    /// Class (specified factor) dimensionality.
    pub s_dim: usize,
    pub device: DeviceChoice,
    pub checkpoint_every: usize,
    pub lr_decay_epoch: usize,
    pub lr_decay_factor: f64,
    pub seed: u64,
    pub run_name: String,
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub images_dir: PathBuf,
    pub figures_dir: PathBuf,
    pub grid_rows: usize,
    pub grid_cols: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            num_epochs: 100,
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            z_dim: 16,
            s_dim: 16,
            device: DeviceChoice::Cuda(0),
            checkpoint_every: 5,
            lr_decay_epoch: 80,
            lr_decay_factor: 0.1,
            seed: 0,
            run_name: "cycle_vae".to_string(),
            data_dir: PathBuf::from("./splits"),
            models_dir: PathBuf::from("./models"),
            images_dir: PathBuf::from("./reconstructed_images"),
            figures_dir: PathBuf::from("./figures"),
            grid_rows: 2,
            grid_cols: 8,
        }
    }
}

impl TrainConfig {
    /// Small CPU config for tests: tiny batches and latents, two epochs.
    pub fn test() -> Self {
        Self {
            batch_size: 2,
            num_epochs: 2,
            learning_rate: 1e-3,
            z_dim: 4,
            s_dim: 4,
            device: DeviceChoice::Cpu,
            checkpoint_every: 1,
            grid_rows: 1,
            grid_cols: 2,
            ..Self::default()
        }
    }

    /// Load a JSON object of overrides; fields it leaves out keep their
    /// value from `base`.
    pub fn from_json_file(path: &Path, base: &TrainConfig) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_over(&raw, base)
    }

    pub fn from_json_over(raw: &str, base: &TrainConfig) -> Result<Self> {
        let serde_json::Value::Object(overrides) = serde_json::from_str::<serde_json::Value>(raw)? else {
            return Err(CycleVaeError::Config("config file must hold a JSON object".into()).into());
        };
        let mut merged = serde_json::to_value(base)?;
        if let serde_json::Value::Object(fields) = &mut merged {
            fields.extend(overrides);
        }
        let config: Self = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return fail("batch_size must be positive".into());
        }
        if self.z_dim == 0 || self.s_dim == 0 {
            return fail(format!("latent dims must be positive (z={}, s={})", self.z_dim, self.s_dim));
        }
        if self.checkpoint_every == 0 {
            return fail("checkpoint_every must be positive".into());
        }
        if self.lr_decay_epoch == 0 {
            return fail("lr_decay_epoch must be positive".into());
        }
        if !(self.learning_rate > 0.0) {
            return fail(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if self.grid_rows * self.grid_cols > self.batch_size {
            return fail(format!(
                "grid {}x{} needs more images than batch_size {}",
                self.grid_rows, self.grid_cols, self.batch_size
            ));
        }
        Ok(())
    }

    /// Checkpoint and visualization cadence: every `checkpoint_every` epochs
    /// (starting at 0) and always at the final epoch.
    pub fn is_snapshot_epoch(&self, epoch: usize) -> bool {
        epoch % self.checkpoint_every == 0 || epoch + 1 == self.num_epochs
    }
}

fn fail(msg: String) -> Result<()> {
    Err(CycleVaeError::Config(msg).into())
}
