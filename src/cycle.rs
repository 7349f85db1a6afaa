//! Dual-cycle training: a forward reconstruction cycle over encoder and
//! decoder, then a reverse latent-consistency cycle that updates the encoder
//! alone.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::TrainConfig;
use crate::data::{to_image_layout, to_network_layout, BatchCursor, PairBatch, SampleSource};
use crate::losses::{
    kl_divergence_loss, kl_normalizer, logged_reverse_cycle, reconstruction_loss,
    reverse_cycle_loss, ForwardLosses,
};
use crate::model::{Decoder, Encoder};
use crate::sampler::LatentSampler;
use crate::sinks::{ProgressSink, VisualizationSink};
use crate::training::{
    checkpoint_file_name, load_checkpoint, save_checkpoint, CheckpointRecord, EpochAccumulator,
    EpochLosses, IterationLosses, ParamGroup, PhaseOptimizer, StepDecay,
};

/// The four loss tensors of one forward cycle, still attached to the graph.
struct ForwardTerms {
    kl: [Tensor; 2],
    reconstruction: [Tensor; 2],
}

impl ForwardTerms {
    fn logged(&self) -> Result<ForwardLosses> {
        Ok(ForwardLosses::combine(
            [self.kl[0].to_scalar::<f32>()?, self.kl[1].to_scalar::<f32>()?],
            [
                self.reconstruction[0].to_scalar::<f32>()?,
                self.reconstruction[1].to_scalar::<f32>()?,
            ],
        ))
    }
}

pub struct DualCycleTrainer {
    config: TrainConfig,
    device: Device,
    encoder: Encoder,
    decoder: Decoder,
    encoder_vars: VarMap,
    decoder_vars: VarMap,
    forward_opt: PhaseOptimizer,
    reverse_opt: PhaseOptimizer,
    sampler: LatentSampler,
    run_timestamp: String,
    start_epoch: usize,
    last_epoch: Option<usize>,
}

impl DualCycleTrainer {
    pub fn new(config: TrainConfig, device: Device) -> Result<Self> {
        config.validate()?;

        let encoder_vars = VarMap::new();
        let decoder_vars = VarMap::new();
        let encoder = Encoder::new(
            config.z_dim,
            config.s_dim,
            VarBuilder::from_varmap(&encoder_vars, DType::F32, &device),
        )?;
        let decoder = Decoder::new(
            config.z_dim,
            config.s_dim,
            VarBuilder::from_varmap(&decoder_vars, DType::F32, &device),
        )?;

        let schedule =
            || StepDecay::new(config.learning_rate, config.lr_decay_factor, config.lr_decay_epoch);
        let forward_group = ParamGroup::from_varmaps(
            "forward_cycle",
            &[("encoder", &encoder_vars), ("decoder", &decoder_vars)],
        )?;
        let reverse_group = ParamGroup::from_varmaps("reverse_cycle", &[("encoder", &encoder_vars)])?;
        let forward_opt = PhaseOptimizer::new(forward_group, schedule(), config.beta1, config.beta2)?;
        let reverse_opt = PhaseOptimizer::new(reverse_group, schedule(), config.beta1, config.beta2)?;

        tracing::info!(
            z_dim = config.z_dim,
            s_dim = config.s_dim,
            forward_params = forward_opt.group().len(),
            reverse_params = reverse_opt.group().len(),
            "dual-cycle trainer ready"
        );

        Ok(Self {
            sampler: LatentSampler::new(config.seed),
            run_timestamp: chrono::Local::now().format("%d%m%Y-%H%M%S").to_string(),
            config,
            device,
            encoder,
            decoder,
            encoder_vars,
            decoder_vars,
            forward_opt,
            reverse_opt,
            start_epoch: 0,
            last_epoch: None,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn encoder_vars(&self) -> &VarMap {
        &self.encoder_vars
    }

    pub fn decoder_vars(&self) -> &VarMap {
        &self.decoder_vars
    }

    /// Epoch the next call to [`fit`](Self::fit) starts from.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn learning_rates(&self) -> (f64, f64) {
        (self.forward_opt.current_lr(), self.reverse_opt.current_lr())
    }

    // -----------------------------------------------------------------------
    // Cycle terms
    // -----------------------------------------------------------------------

    fn forward_terms(&mut self, batch: &PairBatch, train: bool) -> Result<ForwardTerms> {
        let x1 = to_network_layout(&batch.img1)?;
        let x2 = to_network_layout(&batch.img2)?;
        let norm = kl_normalizer(batch.batch_size());

        let out1 = self.encoder.forward(&x1, train)?;
        let out2 = self.encoder.forward(&x2, train)?;
        let kl = [
            kl_divergence_loss(&out1.style_mu, &out1.style_logvar, norm)?,
            kl_divergence_loss(&out2.style_mu, &out2.style_logvar, norm)?,
        ];

        let z1 = self.sampler.reparameterize(train, &out1.style_mu, &out1.style_logvar)?;
        let z2 = self.sampler.reparameterize(train, &out2.style_mu, &out2.style_logvar)?;

        // style from one image, class from its partner
        let rec1 = self.decoder.forward(&z1, &out2.class_embedding, train)?;
        let rec2 = self.decoder.forward(&z2, &out1.class_embedding, train)?;
        let reconstruction = [reconstruction_loss(&rec1, &x1)?, reconstruction_loss(&rec2, &x2)?];

        Ok(ForwardTerms { kl, reconstruction })
    }

    fn reverse_term(&mut self, first: &Tensor, second: &Tensor, train: bool) -> Result<Tensor> {
        let x1 = to_network_layout(first)?;
        let x2 = to_network_layout(second)?;
        let z = self.sampler.sample_prior(x1.dim(0)?, self.config.z_dim, &self.device)?;

        let s1 = self.encoder.forward(&x1, train)?.class_embedding;
        let s2 = self.encoder.forward(&x2, train)?.class_embedding;
        let y1 = self.decoder.forward(&z, &s1, train)?;
        let y2 = self.decoder.forward(&z, &s2, train)?;

        let r1 = self.encoder.forward(&y1, train)?;
        let r2 = self.encoder.forward(&y2, train)?;
        let z1 = self.sampler.reparameterize(false, &r1.style_mu, &r1.style_logvar)?;
        let z2 = self.sampler.reparameterize(false, &r2.style_mu, &r2.style_logvar)?;
        reverse_cycle_loss(&z1, &z2)
    }

    // -----------------------------------------------------------------------
    // Training
    // -----------------------------------------------------------------------

    /// Phase A: KL and swapped reconstruction terms for both images, one
    /// forward-cycle optimizer step over encoder and decoder.
    pub fn forward_cycle_step(&mut self, batch: &PairBatch) -> Result<ForwardLosses> {
        let terms = self.forward_terms(batch, true)?;
        let mut tape = self.forward_opt.tape();
        for term in terms.kl.iter().chain(terms.reconstruction.iter()) {
            tape.accumulate(term)?;
        }
        self.forward_opt.apply(tape)?;
        terms.logged()
    }

    /// Phase B: class embeddings of two unrelated channel-last batches are
    /// decoded with one shared prior style; the recovered style means must
    /// agree. Only encoder parameters are stepped. Returns the unamplified
    /// loss.
    pub fn reverse_cycle_step(&mut self, first: &Tensor, second: &Tensor) -> Result<f32> {
        let loss = self.reverse_term(first, second, true)?;
        let mut tape = self.reverse_opt.tape();
        tape.accumulate(&loss)?;
        self.reverse_opt.apply(tape)?;
        Ok(logged_reverse_cycle(loss.to_scalar::<f32>()?))
    }

    /// One forward step then one reverse step. Values are scaled by batch
    /// size for the epoch accumulator.
    pub fn train_iteration<S: SampleSource>(
        &mut self,
        cursor: &mut BatchCursor<S>,
    ) -> Result<IterationLosses> {
        let batch = cursor.next_batch()?;
        let weight = batch.batch_size() as f64;
        let forward = self.forward_cycle_step(&batch)?;

        let first = cursor.next_batch()?;
        let second = cursor.next_batch()?;
        let reverse = self.reverse_cycle_step(&first.img1, &second.img1)?;

        Ok(IterationLosses {
            kl_divergence: forward.kl_divergence as f64 * weight,
            reconstruction: forward.reconstruction as f64 * weight,
            reverse_cycle: reverse as f64 * weight,
        })
    }

    pub fn train_epoch<S: SampleSource>(
        &mut self,
        epoch: usize,
        cursor: &mut BatchCursor<S>,
    ) -> Result<EpochLosses> {
        self.forward_opt.set_epoch(epoch);
        self.reverse_opt.set_epoch(epoch);

        let start = Instant::now();
        let mut acc = EpochAccumulator::new();
        for iteration in 0..cursor.batches_per_pass() {
            let losses = self.train_iteration(cursor)?;
            if !losses.is_finite() {
                tracing::warn!(epoch, iteration, ?losses, "non-finite loss");
            }
            acc.record(losses);
        }
        let losses = acc.finish(epoch);
        self.last_epoch = Some(epoch);

        tracing::info!(
            epoch,
            kl = losses.kl_divergence_error,
            reconstruction = losses.reconstruction_error,
            reverse_cycle = losses.reverse_cycle_loss,
            iterations = losses.iterations,
            elapsed_s = start.elapsed().as_secs_f64(),
            "epoch done"
        );
        Ok(losses)
    }

    /// Train from [`start_epoch`](Self::start_epoch) to `num_epochs`. Snapshot
    /// epochs write a checkpoint and four image grids; metrics go to
    /// `progress` every epoch. Sink failures are logged and skipped.
    pub fn fit<S: SampleSource>(
        &mut self,
        cursor: &mut BatchCursor<S>,
        visuals: &mut dyn VisualizationSink,
        progress: &mut dyn ProgressSink,
    ) -> Result<Vec<EpochLosses>> {
        let mut history = Vec::new();
        for epoch in self.start_epoch..self.config.num_epochs {
            let losses = self.train_epoch(epoch, cursor)?;

            if self.config.is_snapshot_epoch(epoch) {
                if let Err(e) = self.save_checkpoint(&losses) {
                    tracing::warn!(epoch, "checkpoint not written: {e:#}");
                }
                self.render_grids(epoch, cursor, visuals)?;
            }
            if let Err(e) = progress.update(epoch, &losses.metrics()) {
                tracing::warn!(epoch, "progress update failed: {e:#}");
            }

            history.push(losses);
            self.start_epoch = epoch + 1;
        }
        Ok(history)
    }

    // -----------------------------------------------------------------------
    // Evaluation and visualization
    // -----------------------------------------------------------------------

    /// Both cycle losses over `iterations` iterations with no parameter
    /// updates, using running normalization statistics and mean latents.
    pub fn evaluate<S: SampleSource>(
        &mut self,
        cursor: &mut BatchCursor<S>,
        iterations: usize,
    ) -> Result<EpochLosses> {
        let mut acc = EpochAccumulator::new();
        for _ in 0..iterations {
            let batch = cursor.next_batch()?;
            let weight = batch.batch_size() as f64;
            let forward = self.forward_terms(&batch, false)?.logged()?;

            let first = cursor.next_batch()?;
            let second = cursor.next_batch()?;
            let reverse = self.reverse_term(&first.img1, &second.img1, false)?;
            let reverse = logged_reverse_cycle(reverse.to_scalar::<f32>()?);

            acc.record(IterationLosses {
                kl_divergence: forward.kl_divergence as f64 * weight,
                reconstruction: forward.reconstruction as f64 * weight,
                reverse_cycle: reverse as f64 * weight,
            });
        }
        Ok(acc.finish(self.last_epoch.unwrap_or(0)))
    }

    /// Decode the style of `style_source` with the class of `class_source`.
    /// Both inputs and the result are channel-last; the result is detached.
    pub fn swap_styles(&self, style_source: &Tensor, class_source: &Tensor) -> Result<Tensor> {
        let style = self.encoder.forward(&to_network_layout(style_source)?, false)?;
        let class = self.encoder.forward(&to_network_layout(class_source)?, false)?;
        let images = self
            .decoder
            .forward(&style.style_mu, &class.class_embedding, false)?;
        Ok(to_image_layout(&images)?.detach())
    }

    fn render_grids<S: SampleSource>(
        &mut self,
        epoch: usize,
        cursor: &mut BatchCursor<S>,
        sink: &mut dyn VisualizationSink,
    ) -> Result<()> {
        let pair = cursor.next_batch()?;
        let other = cursor.next_batch()?;
        let target = self.swap_styles(&pair.img1, &pair.img2)?;
        let style_target = self.swap_styles(&other.img2, &pair.img2)?;

        let grids = [
            ("original", &pair.img1),
            ("target", &target),
            ("style", &other.img2),
            ("style_target", &style_target),
        ];
        for (suffix, images) in grids {
            let label = format!("{epoch}_{suffix}");
            if let Err(e) = sink.image_grid(images, &label) {
                tracing::warn!(label = %label, "image grid not written: {e:#}");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.config.models_dir.join(checkpoint_file_name(
            &self.config.run_name,
            &self.run_timestamp,
            epoch,
        ))
    }

    pub fn save_checkpoint(&self, losses: &EpochLosses) -> Result<PathBuf> {
        let path = self.checkpoint_path(losses.epoch);
        save_checkpoint(
            &path,
            &CheckpointRecord::from(losses),
            &self.encoder_vars,
            &self.decoder_vars,
        )?;
        Ok(path)
    }

    /// Restore encoder and decoder from a checkpoint; training continues at
    /// the following epoch. Optimizer moments start fresh.
    pub fn resume_from(&mut self, path: &Path) -> Result<CheckpointRecord> {
        let record = load_checkpoint(path, &self.encoder_vars, &self.decoder_vars, &self.device)?;
        self.start_epoch = record.epoch + 1;
        self.last_epoch = Some(record.epoch);
        tracing::info!(path = %path.display(), next_epoch = self.start_epoch, "resuming");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IMAGE_SIZE;
    use crate::data::{InMemorySource, SamplePair};
    use std::collections::BTreeMap;

    fn random_source(n: usize, device: &Device) -> Result<InMemorySource> {
        let pairs = (0..n)
            .map(|_| {
                Ok(SamplePair {
                    img1: Tensor::rand(0f32, 1.0, (IMAGE_SIZE, IMAGE_SIZE, 3), device)?,
                    img2: Tensor::rand(0f32, 1.0, (IMAGE_SIZE, IMAGE_SIZE, 3), device)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(InMemorySource::new(pairs))
    }

    fn setup() -> Result<(DualCycleTrainer, BatchCursor<InMemorySource>)> {
        let device = Device::Cpu;
        let config = TrainConfig::test();
        let cursor = BatchCursor::new(random_source(4, &device)?, config.batch_size, 0)?;
        Ok((DualCycleTrainer::new(config, device)?, cursor))
    }

    fn params(prefix: &str, varmap: &VarMap) -> Result<BTreeMap<String, Tensor>> {
        ParamGroup::from_varmaps(prefix, &[(prefix, varmap)])?.snapshot()
    }

    fn total_change(before: &BTreeMap<String, Tensor>, after: &BTreeMap<String, Tensor>) -> Result<f32> {
        let mut total = 0f32;
        for (name, old) in before {
            total += (&after[name] - old)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        }
        Ok(total)
    }

    #[test]
    fn test_one_iteration_updates_both_networks() -> Result<()> {
        let (mut trainer, mut cursor) = setup()?;
        let enc_before = params("encoder", trainer.encoder_vars())?;
        let dec_before = params("decoder", trainer.decoder_vars())?;

        let losses = trainer.train_iteration(&mut cursor)?;

        assert!(total_change(&enc_before, &params("encoder", trainer.encoder_vars())?)? > 0.0);
        assert!(total_change(&dec_before, &params("decoder", trainer.decoder_vars())?)? > 0.0);
        for v in [losses.kl_divergence, losses.reconstruction, losses.reverse_cycle] {
            assert!(v.is_finite() && v >= 0.0, "logged value {v}");
        }
        Ok(())
    }

    #[test]
    fn test_reverse_step_leaves_decoder_unchanged() -> Result<()> {
        let (mut trainer, mut cursor) = setup()?;
        let first = cursor.next_batch()?;
        let second = cursor.next_batch()?;
        let enc_before = params("encoder", trainer.encoder_vars())?;
        let dec_before = params("decoder", trainer.decoder_vars())?;

        let loss = trainer.reverse_cycle_step(&first.img1, &second.img1)?;

        assert!(loss.is_finite() && loss >= 0.0);
        assert_eq!(total_change(&dec_before, &params("decoder", trainer.decoder_vars())?)?, 0.0);
        assert!(total_change(&enc_before, &params("encoder", trainer.encoder_vars())?)? > 0.0);
        Ok(())
    }

    #[test]
    fn test_evaluate_does_not_update() -> Result<()> {
        let (mut trainer, mut cursor) = setup()?;
        let enc_before = params("encoder", trainer.encoder_vars())?;
        let dec_before = params("decoder", trainer.decoder_vars())?;

        let losses = trainer.evaluate(&mut cursor, 2)?;

        assert_eq!(losses.iterations, 2);
        assert!(losses.reconstruction_error.is_finite());
        assert_eq!(total_change(&enc_before, &params("encoder", trainer.encoder_vars())?)?, 0.0);
        assert_eq!(total_change(&dec_before, &params("decoder", trainer.decoder_vars())?)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_swap_styles_is_channel_last() -> Result<()> {
        let (trainer, mut cursor) = setup()?;
        let batch = cursor.next_batch()?;
        let swapped = trainer.swap_styles(&batch.img1, &batch.img2)?;
        assert_eq!(swapped.dims(), &[2, IMAGE_SIZE, IMAGE_SIZE, 3]);
        Ok(())
    }

    #[test]
    fn test_epoch_sets_decayed_lr() -> Result<()> {
        let (mut trainer, mut cursor) = setup()?;
        let base = trainer.config().learning_rate;
        trainer.train_epoch(80, &mut cursor)?;
        let (forward, reverse) = trainer.learning_rates();
        assert!((forward - base * 0.1).abs() < 1e-12);
        assert!((reverse - base * 0.1).abs() < 1e-12);
        Ok(())
    }
}
