//! Paired-sprite sample sources and the batch cursor that feeds the trainer.
//!
//! Images are channel-last (`H×W×3`) at this boundary; the networks consume
//! channel-first batches, see [`to_network_layout`].

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

use crate::config::IMAGE_CHANNELS;
use crate::error::CycleVaeError;

/// Two images related by class/style, each `H×W×3` f32.
#[derive(Clone, Debug)]
pub struct SamplePair {
    pub img1: Tensor,
    pub img2: Tensor,
}

pub trait SampleSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<SamplePair>;
}

// ---------------------------------------------------------------------------
// Layout conversion
// ---------------------------------------------------------------------------

/// `B×H×W×C` -> `B×C×H×W`.
pub fn to_network_layout(images: &Tensor) -> Result<Tensor> {
    Ok(images.permute((0, 3, 1, 2))?.contiguous()?)
}

/// `B×C×H×W` -> `B×H×W×C`.
pub fn to_image_layout(images: &Tensor) -> Result<Tensor> {
    Ok(images.permute((0, 2, 3, 1))?.contiguous()?)
}

/// Normalize a raw `H×W×C` raster: drop any alpha channel and convert to f32.
/// `u8` pixels are scaled into `[0, 1]`; float pixels are kept as-is.
pub fn prepare_image(raw: &Tensor, location: &str) -> Result<Tensor> {
    let dims = raw.dims();
    if dims.len() != 3 {
        return Err(CycleVaeError::malformed(
            location,
            format!("expected H×W×C raster, got shape {dims:?}"),
        )
        .into());
    }
    let channels = dims[2];
    if channels != IMAGE_CHANNELS && channels != IMAGE_CHANNELS + 1 {
        return Err(CycleVaeError::malformed(
            location,
            format!("expected 3 or 4 channels, got {channels}"),
        )
        .into());
    }
    let rgb = raw.narrow(2, 0, IMAGE_CHANNELS)?;
    let rgb = match rgb.dtype() {
        DType::U8 => (rgb.to_dtype(DType::F32)? / 255.0)?,
        _ => rgb.to_dtype(DType::F32)?,
    };
    Ok(rgb.contiguous()?)
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Pairs held in memory, already prepared.
pub struct InMemorySource {
    pairs: Vec<SamplePair>,
}

impl InMemorySource {
    pub fn new(pairs: Vec<SamplePair>) -> Self {
        Self { pairs }
    }
}

impl SampleSource for InMemorySource {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn get(&self, index: usize) -> Result<SamplePair> {
        self.pairs
            .get(index)
            .cloned()
            .ok_or_else(|| CycleVaeError::malformed(format!("index {index}"), "out of range").into())
    }
}

/// One `.safetensors` file per pair under `{root}/{split}`, each holding
/// `img1` and `img2` rasters. Files are read lazily on `get`.
pub struct DirectorySource {
    files: Vec<PathBuf>,
    device: Device,
}

impl DirectorySource {
    pub fn open(root: &Path, split: &str, device: &Device) -> Result<Self> {
        let dir = root.join(split);
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("reading sample directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "safetensors") {
                files.push(path);
            }
        }
        files.sort();
        tracing::info!(split, samples = files.len(), dir = %dir.display(), "opened sample source");
        Ok(Self {
            files,
            device: device.clone(),
        })
    }
}

impl SampleSource for DirectorySource {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize) -> Result<SamplePair> {
        let path = self
            .files
            .get(index)
            .ok_or_else(|| CycleVaeError::malformed(format!("index {index}"), "out of range"))?;
        let location = path.display().to_string();
        let tensors = candle_core::safetensors::load(path, &self.device)
            .map_err(|e| CycleVaeError::malformed(&location, e.to_string()))?;
        let take = |name: &str| -> Result<Tensor> {
            let raw = tensors
                .get(name)
                .ok_or_else(|| CycleVaeError::malformed(&location, format!("missing tensor '{name}'")))?;
            prepare_image(raw, &format!("{location}:{name}"))
        };
        Ok(SamplePair {
            img1: take("img1")?,
            img2: take("img2")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Batch cursor
// ---------------------------------------------------------------------------

/// A stacked batch of pairs, each `B×H×W×3`.
#[derive(Clone, Debug)]
pub struct PairBatch {
    pub img1: Tensor,
    pub img2: Tensor,
}

impl PairBatch {
    pub fn batch_size(&self) -> usize {
        self.img1.dims().first().copied().unwrap_or(0)
    }
}

/// Endless, reshuffling iteration over a source in fixed-size batches.
///
/// Each pass visits a fresh permutation of the source; a trailing remainder
/// smaller than `batch_size` is dropped. When a pass is exhausted the cursor
/// reshuffles and starts over, so `next_batch` never runs dry.
pub struct BatchCursor<S: SampleSource> {
    source: S,
    batch_size: usize,
    order: Vec<usize>,
    position: usize,
    passes: usize,
    rng: StdRng,
}

impl<S: SampleSource> BatchCursor<S> {
    pub fn new(source: S, batch_size: usize, seed: u64) -> Result<Self> {
        let len = source.len();
        if batch_size == 0 || len < batch_size {
            return Err(CycleVaeError::SourceTooSmall { len, batch_size }.into());
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut rng);
        Ok(Self {
            source,
            batch_size,
            order,
            position: 0,
            passes: 0,
            rng,
        })
    }

    /// Full batches per pass over the source.
    pub fn batches_per_pass(&self) -> usize {
        self.source.len() / self.batch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Completed passes (reshuffles) so far.
    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn next_batch(&mut self) -> Result<PairBatch> {
        if self.position + self.batch_size > self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.position = 0;
            self.passes += 1;
            tracing::debug!(passes = self.passes, "sample source wrapped, reshuffled");
        }
        let indices = &self.order[self.position..self.position + self.batch_size];
        self.position += self.batch_size;

        let mut firsts = Vec::with_capacity(self.batch_size);
        let mut seconds = Vec::with_capacity(self.batch_size);
        for &index in indices {
            let pair = self.source.get(index)?;
            firsts.push(pair.img1);
            seconds.push(pair.img2);
        }
        Ok(PairBatch {
            img1: stack_images(&firsts, "img1 batch")?,
            img2: stack_images(&seconds, "img2 batch")?,
        })
    }
}

fn stack_images(images: &[Tensor], what: &'static str) -> Result<Tensor> {
    let expected = images[0].dims();
    if let Some(odd) = images.iter().find(|img| img.dims() != expected) {
        return Err(CycleVaeError::shape(what, format!("{expected:?} for every sample"), odd.dims()).into());
    }
    Ok(Tensor::stack(images, 0)?)
}
