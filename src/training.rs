use anyhow::{anyhow, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::CycleVaeError;

// ---------------------------------------------------------------------------
// Step LR decay
// ---------------------------------------------------------------------------

/// `lr = base_lr * factor^(epoch / step_epochs)`.
pub struct StepDecay {
    base_lr: f64,
    factor: f64,
    step_epochs: usize,
}

impl StepDecay {
    pub fn new(base_lr: f64, factor: f64, step_epochs: usize) -> Self {
        Self {
            base_lr,
            factor,
            step_epochs: step_epochs.max(1),
        }
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        self.base_lr * self.factor.powi((epoch / self.step_epochs) as i32)
    }
}

// ---------------------------------------------------------------------------
// Parameter groups
// ---------------------------------------------------------------------------

/// Named set of trainable variables an optimizer owns. Normalization running
/// statistics live in the same VarMaps but are never optimized.
#[derive(Clone)]
pub struct ParamGroup {
    name: String,
    vars: Vec<(String, Var)>,
}

impl ParamGroup {
    pub fn from_varmaps(name: &str, varmaps: &[(&str, &VarMap)]) -> Result<Self> {
        let mut vars = Vec::new();
        for (prefix, varmap) in varmaps {
            let data = varmap
                .data()
                .lock()
                .map_err(|e| anyhow!("varmap lock poisoned: {e}"))?;
            for (var_name, var) in data.iter() {
                if is_running_stat(var_name) {
                    continue;
                }
                vars.push((format!("{prefix}.{var_name}"), var.clone()));
            }
        }
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self {
            name: name.to_string(),
            vars,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        self.vars.iter().map(|(_, v)| v)
    }

    /// Detached copies of every parameter, keyed by qualified name.
    pub fn snapshot(&self) -> Result<BTreeMap<String, Tensor>> {
        self.vars
            .iter()
            .map(|(name, var)| -> Result<(String, Tensor)> {
                Ok((name.clone(), var.as_tensor().detach().copy()?))
            })
            .collect()
    }
}

fn is_running_stat(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

// ---------------------------------------------------------------------------
// Gradient tape
// ---------------------------------------------------------------------------

/// Gradient accumulator for one optimization phase.
///
/// Every `accumulate` call backpropagates one loss term through the shared
/// forward graph and adds its parameter gradients to the running sum, so the
/// terms may arrive in any order. The tape is consumed by
/// [`PhaseOptimizer::apply`]; gradients never leak across a phase boundary.
pub struct GradTape {
    vars: Vec<Var>,
    grads: Option<GradStore>,
    terms: usize,
}

impl GradTape {
    pub fn new(group: &ParamGroup) -> Self {
        Self {
            vars: group.vars().cloned().collect(),
            grads: None,
            terms: 0,
        }
    }

    pub fn accumulate(&mut self, loss: &Tensor) -> Result<()> {
        let fresh = loss.backward()?;
        let merged = match self.grads.take() {
            None => fresh,
            Some(mut acc) => {
                for var in &self.vars {
                    let Some(g) = fresh.get(var.as_tensor()) else {
                        continue;
                    };
                    let sum = match acc.get(var.as_tensor()) {
                        Some(prev) => (prev + g)?,
                        None => g.clone(),
                    };
                    acc.insert(var.as_tensor(), sum);
                }
                acc
            }
        };
        self.grads = Some(merged);
        self.terms += 1;
        Ok(())
    }

    /// Number of loss terms accumulated so far.
    pub fn terms(&self) -> usize {
        self.terms
    }

    pub fn grad(&self, var: &Var) -> Option<&Tensor> {
        self.grads.as_ref()?.get(var.as_tensor())
    }
}

// ---------------------------------------------------------------------------
// Phase optimizer
// ---------------------------------------------------------------------------

/// An Adam optimizer bound to one parameter group, with step LR decay.
pub struct PhaseOptimizer {
    optimizer: AdamW,
    group: ParamGroup,
    schedule: StepDecay,
    step_count: usize,
}

impl PhaseOptimizer {
    pub fn new(group: ParamGroup, schedule: StepDecay, beta1: f64, beta2: f64) -> Result<Self> {
        let params = ParamsAdamW {
            lr: schedule.lr_at(0),
            beta1,
            beta2,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let vars: Vec<Var> = group.vars().cloned().collect();
        let optimizer = AdamW::new(vars, params)?;
        tracing::debug!(group = group.name(), params = group.len(), "optimizer registered");
        Ok(Self {
            optimizer,
            group,
            schedule,
            step_count: 0,
        })
    }

    /// Start accumulating gradients for this optimizer's parameters.
    pub fn tape(&self) -> GradTape {
        GradTape::new(&self.group)
    }

    pub fn apply(&mut self, tape: GradTape) -> Result<()> {
        let grads = tape
            .grads
            .ok_or_else(|| anyhow!("{}: no loss terms accumulated before step", self.group.name()))?;
        self.optimizer.step(&grads)?;
        self.step_count += 1;
        Ok(())
    }

    /// Set the learning rate for `epoch` from the decay schedule.
    pub fn set_epoch(&mut self, epoch: usize) {
        let lr = self.schedule.lr_at(epoch);
        if (lr - self.optimizer.learning_rate()).abs() > f64::EPSILON * lr.abs().max(1.0) {
            tracing::info!(group = self.group.name(), epoch, lr, "learning rate decayed");
        }
        self.optimizer.set_learning_rate(lr);
    }

    pub fn current_lr(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn group(&self) -> &ParamGroup {
        &self.group
    }
}

// ---------------------------------------------------------------------------
// Epoch statistics
// ---------------------------------------------------------------------------

/// Batch-weighted losses recorded for a single iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationLosses {
    pub kl_divergence: f64,
    pub reconstruction: f64,
    pub reverse_cycle: f64,
}

impl IterationLosses {
    pub fn is_finite(&self) -> bool {
        self.kl_divergence.is_finite() && self.reconstruction.is_finite() && self.reverse_cycle.is_finite()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochLosses {
    pub epoch: usize,
    pub kl_divergence_error: f64,
    pub reconstruction_error: f64,
    pub reverse_cycle_loss: f64,
    pub iterations: usize,
    pub non_finite_iterations: usize,
}

impl EpochLosses {
    pub fn metrics(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("kl_divergence_error", self.kl_divergence_error),
            ("reconstruction_error", self.reconstruction_error),
            ("reverse_cycle_loss", self.reverse_cycle_loss),
        ])
    }
}

/// Running sums for one epoch; averaged by iteration count at the end.
#[derive(Debug, Default)]
pub struct EpochAccumulator {
    sums: IterationLosses,
    iterations: usize,
    non_finite: usize,
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, losses: IterationLosses) {
        if !losses.is_finite() {
            self.non_finite += 1;
        }
        self.sums.kl_divergence += losses.kl_divergence;
        self.sums.reconstruction += losses.reconstruction;
        self.sums.reverse_cycle += losses.reverse_cycle;
        self.iterations += 1;
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn finish(&self, epoch: usize) -> EpochLosses {
        let n = self.iterations.max(1) as f64;
        EpochLosses {
            epoch,
            kl_divergence_error: self.sums.kl_divergence / n,
            reconstruction_error: self.sums.reconstruction / n,
            reverse_cycle_loss: self.sums.reverse_cycle / n,
            iterations: self.iterations,
            non_finite_iterations: self.non_finite,
        }
    }
}

// ---------------------------------------------------------------------------
// Model checkpointing (safetensors)
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub epoch: usize,
    pub kl_divergence_error: f64,
    pub reconstruction_error: f64,
    pub reverse_cycle_loss: f64,
}

impl From<&EpochLosses> for CheckpointRecord {
    fn from(losses: &EpochLosses) -> Self {
        Self {
            epoch: losses.epoch,
            kl_divergence_error: losses.kl_divergence_error,
            reconstruction_error: losses.reconstruction_error,
            reverse_cycle_loss: losses.reverse_cycle_loss,
        }
    }
}

const META_EPOCH: &str = "meta.epoch";
const META_KL: &str = "meta.kl_divergence_error";
const META_RECONSTRUCTION: &str = "meta.reconstruction_error";
const META_REVERSE: &str = "meta.reverse_cycle_loss";

pub fn checkpoint_file_name(run_name: &str, timestamp: &str, epoch: usize) -> String {
    format!("{run_name}_{timestamp}_{epoch}.safetensors")
}

fn collect_vars(prefix: &str, varmap: &VarMap, out: &mut HashMap<String, Tensor>) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| anyhow!("varmap lock poisoned: {e}"))?;
    for (name, var) in data.iter() {
        out.insert(format!("{prefix}.{name}"), var.as_tensor().clone());
    }
    Ok(())
}

/// Write encoder and decoder state plus the epoch record to one file. The
/// bytes go to a sibling temp file first and are renamed into place, so a
/// reader never observes a partial checkpoint.
pub fn save_checkpoint(
    path: &Path,
    record: &CheckpointRecord,
    encoder: &VarMap,
    decoder: &VarMap,
) -> Result<()> {
    let mut named = HashMap::new();
    collect_vars("encoder", encoder, &mut named)?;
    collect_vars("decoder", decoder, &mut named)?;
    let n_params = named.len();

    let cpu = Device::Cpu;
    named.insert(META_EPOCH.to_string(), Tensor::new(&[record.epoch as i64], &cpu)?);
    named.insert(META_KL.to_string(), Tensor::new(&[record.kl_divergence_error], &cpu)?);
    named.insert(
        META_RECONSTRUCTION.to_string(),
        Tensor::new(&[record.reconstruction_error], &cpu)?,
    );
    named.insert(META_REVERSE.to_string(), Tensor::new(&[record.reverse_cycle_loss], &cpu)?);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("safetensors.tmp");
    candle_core::safetensors::save(&named, &tmp)?;
    std::fs::rename(&tmp, path)?;
    tracing::info!(path = %path.display(), params = n_params, epoch = record.epoch, "checkpoint saved");
    Ok(())
}

/// Pair every variable of `varmap` with its saved tensor, checking presence,
/// shape and dtype. Nothing is written.
fn stage_vars(
    prefix: &str,
    varmap: &VarMap,
    tensors: &HashMap<String, Tensor>,
    staged: &mut Vec<(Var, Tensor)>,
) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| anyhow!("varmap lock poisoned: {e}"))?;
    for (name, var) in data.iter() {
        let key = format!("{prefix}.{name}");
        let saved = tensors
            .get(&key)
            .ok_or_else(|| CycleVaeError::CheckpointMissing(key.clone()))?;
        if saved.dims() != var.dims() || saved.dtype() != var.dtype() {
            return Err(anyhow!(
                "checkpoint tensor {key} is {:?} {:?}, expected {:?} {:?}",
                saved.dtype(),
                saved.dims(),
                var.dtype(),
                var.dims()
            ));
        }
        staged.push((var.clone(), saved.clone()));
    }
    Ok(())
}

fn meta_scalar(tensors: &HashMap<String, Tensor>, key: &str) -> Result<Tensor> {
    let t = tensors
        .get(key)
        .ok_or_else(|| CycleVaeError::CheckpointMissing(key.to_string()))?;
    Ok(t.flatten_all()?.get(0)?)
}

/// Restore encoder and decoder state in place and return the saved record.
/// Every variable in both VarMaps must be present in the file with a matching
/// shape; the VarMaps are only written once the whole file has been checked.
pub fn load_checkpoint(
    path: &Path,
    encoder: &VarMap,
    decoder: &VarMap,
    device: &Device,
) -> Result<CheckpointRecord> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let mut staged = Vec::new();
    stage_vars("encoder", encoder, &tensors, &mut staged)?;
    stage_vars("decoder", decoder, &tensors, &mut staged)?;

    let epoch = meta_scalar(&tensors, META_EPOCH)?.to_dtype(DType::I64)?.to_scalar::<i64>()?;
    let read = |key: &str| -> Result<f64> {
        Ok(meta_scalar(&tensors, key)?.to_dtype(DType::F64)?.to_scalar::<f64>()?)
    };
    let record = CheckpointRecord {
        epoch: usize::try_from(epoch).map_err(|_| anyhow!("negative epoch {epoch} in checkpoint"))?,
        kl_divergence_error: read(META_KL)?,
        reconstruction_error: read(META_RECONSTRUCTION)?,
        reverse_cycle_loss: read(META_REVERSE)?,
    };

    for (var, saved) in &staged {
        var.set(saved)?;
    }
    tracing::info!(path = %path.display(), params = staged.len(), epoch = record.epoch, "checkpoint loaded");
    Ok(record)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
