//! Encoder, decoder and classifier networks for 60×60 RGB sprites.
//!
//! All layers are built through [`LayerInit`], which owns the weight
//! initialization policy for the three layer kinds the networks use.

use anyhow::Result;
use candle_core::{Shape, Tensor};
use candle_nn::{
    ops::leaky_relu, BatchNorm, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Init,
    Linear, VarBuilder,
};

use crate::config::{IMAGE_CHANNELS, IMAGE_SIZE};
use crate::error::CycleVaeError;

/// Channel widths through the encoder's conv stack.
pub const ENCODER_WIDTHS: [usize; 5] = [IMAGE_CHANNELS, 16, 32, 64, 128];
/// Channel widths through the decoder's transpose-conv stack.
pub const DECODER_WIDTHS: [usize; 5] = [256, 64, 32, 16, IMAGE_CHANNELS];
/// Padding per decoder stage: 2 -> 6 -> 14 -> 30 -> 60.
const DECODER_PADDING: [usize; 4] = [0, 0, 0, 1];
/// Encoder feature map after the conv stack is 128×2×2.
pub const FLAT_FEATURES: usize = 512;
/// Width of each decoder input projection.
pub const PROJECTION_WIDTH: usize = 512;
const LEAKY_SLOPE: f64 = 0.2;
const BN_EPS: f64 = 1e-5;

// ---------------------------------------------------------------------------
// Layer initialization
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Convolution,
    Normalization,
    Linear,
}

impl LayerKind {
    pub fn weight_init(self) -> Init {
        match self {
            LayerKind::Convolution | LayerKind::Linear => Init::Randn {
                mean: 0.0,
                stdev: 0.05,
            },
            LayerKind::Normalization => Init::Randn {
                mean: 1.0,
                stdev: 0.02,
            },
        }
    }

    pub fn bias_init(self) -> Init {
        Init::Const(0.0)
    }
}

/// Builds layers under one `VarBuilder`, applying the per-kind init policy
/// and recording every layer it creates.
pub struct LayerInit<'a> {
    vb: VarBuilder<'a>,
    layers: Vec<(String, LayerKind)>,
}

impl<'a> LayerInit<'a> {
    pub fn new(vb: VarBuilder<'a>) -> Self {
        Self {
            vb,
            layers: Vec::new(),
        }
    }

    fn params(
        &mut self,
        kind: LayerKind,
        name: &str,
        weight_shape: impl Into<Shape>,
        bias_len: usize,
    ) -> Result<(Tensor, Tensor)> {
        let vb = self.vb.pp(name);
        let weight = vb.get_with_hints(weight_shape, "weight", kind.weight_init())?;
        let bias = vb.get_with_hints(bias_len, "bias", kind.bias_init())?;
        self.layers.push((name.to_string(), kind));
        Ok((weight, bias))
    }

    pub fn conv2d(
        &mut self,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        config: Conv2dConfig,
    ) -> Result<Conv2d> {
        let (w, b) = self.params(
            LayerKind::Convolution,
            name,
            (out_channels, in_channels, kernel, kernel),
            out_channels,
        )?;
        Ok(Conv2d::new(w, Some(b), config))
    }

    pub fn conv_transpose2d(
        &mut self,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        config: ConvTranspose2dConfig,
    ) -> Result<ConvTranspose2d> {
        // transpose-conv weights are laid out (in, out, k, k)
        let (w, b) = self.params(
            LayerKind::Convolution,
            name,
            (in_channels, out_channels, kernel, kernel),
            out_channels,
        )?;
        Ok(ConvTranspose2d::new(w, Some(b), config))
    }

    pub fn batch_norm(&mut self, name: &str, features: usize) -> Result<BatchNorm> {
        let stats = self.vb.pp(name);
        let running_mean = stats.get_with_hints(features, "running_mean", Init::Const(0.0))?;
        let running_var = stats.get_with_hints(features, "running_var", Init::Const(1.0))?;
        let (w, b) = self.params(LayerKind::Normalization, name, features, features)?;
        Ok(BatchNorm::new(features, running_mean, running_var, w, b, BN_EPS)?)
    }

    pub fn linear(&mut self, name: &str, in_features: usize, out_features: usize) -> Result<Linear> {
        let (w, b) = self.params(LayerKind::Linear, name, (out_features, in_features), out_features)?;
        Ok(Linear::new(w, Some(b)))
    }

    pub fn finish(self) -> Vec<(String, LayerKind)> {
        self.layers
    }
}

fn expect_dims(tensor: &'static str, t: &Tensor, expected: &[Option<usize>]) -> Result<()> {
    let dims = t.dims();
    let ok = dims.len() == expected.len()
        && dims
            .iter()
            .zip(expected)
            .all(|(&d, e)| e.map_or(true, |e| e == d));
    if ok {
        return Ok(());
    }
    let pretty: Vec<String> = expected
        .iter()
        .map(|e| e.map_or_else(|| "B".to_string(), |e| e.to_string()))
        .collect();
    Err(CycleVaeError::shape(tensor, pretty.join("×"), dims).into())
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

pub struct EncoderOutput {
    pub style_mu: Tensor,
    pub style_logvar: Tensor,
    pub class_embedding: Tensor,
}

pub struct Encoder {
    blocks: Vec<(Conv2d, BatchNorm)>,
    style_mu: Linear,
    style_logvar: Linear,
    class_output: Linear,
    layers: Vec<(String, LayerKind)>,
}

impl Encoder {
    pub fn new(z_dim: usize, s_dim: usize, vb: VarBuilder) -> Result<Self> {
        let mut init = LayerInit::new(vb);
        let mut blocks = Vec::with_capacity(4);
        for (i, pair) in ENCODER_WIDTHS.windows(2).enumerate() {
            let cfg = Conv2dConfig {
                padding: 1,
                stride: 2,
                ..Default::default()
            };
            let conv = init.conv2d(&format!("conv_{}", i + 1), pair[0], pair[1], 5, cfg)?;
            let bn = init.batch_norm(&format!("bn_{}", i + 1), pair[1])?;
            blocks.push((conv, bn));
        }

        let style_mu = init.linear("style_mu", FLAT_FEATURES, z_dim)?;
        let style_logvar = init.linear("style_logvar", FLAT_FEATURES, z_dim)?;
        let class_output = init.linear("class_output", FLAT_FEATURES, s_dim)?;

        Ok(Self {
            blocks,
            style_mu,
            style_logvar,
            class_output,
            layers: init.finish(),
        })
    }

    /// `x`: `B×3×60×60`. `train` selects batch statistics in the norm layers.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<EncoderOutput> {
        expect_dims(
            "encoder input",
            x,
            &[None, Some(IMAGE_CHANNELS), Some(IMAGE_SIZE), Some(IMAGE_SIZE)],
        )?;

        let mut h = x.clone();
        for (conv, bn) in &self.blocks {
            h = h.apply(conv)?.apply_t(bn, train)?.relu()?;
        }
        let flat = h.flatten_from(1)?;

        Ok(EncoderOutput {
            style_mu: flat.apply(&self.style_mu)?,
            style_logvar: flat.apply(&self.style_logvar)?,
            class_embedding: flat.apply(&self.class_output)?,
        })
    }

    pub fn layers(&self) -> &[(String, LayerKind)] {
        &self.layers
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

pub struct Decoder {
    style_input: Linear,
    class_input: Linear,
    deconvs: Vec<ConvTranspose2d>,
    norms: Vec<BatchNorm>,
    z_dim: usize,
    s_dim: usize,
    layers: Vec<(String, LayerKind)>,
}

impl Decoder {
    pub fn new(z_dim: usize, s_dim: usize, vb: VarBuilder) -> Result<Self> {
        let mut init = LayerInit::new(vb);
        let style_input = init.linear("style_input", z_dim, PROJECTION_WIDTH)?;
        let class_input = init.linear("class_input", s_dim, PROJECTION_WIDTH)?;

        let mut deconvs = Vec::with_capacity(4);
        let mut norms = Vec::with_capacity(3);
        let last = DECODER_PADDING.len() - 1;
        for (i, pair) in DECODER_WIDTHS.windows(2).enumerate() {
            let cfg = ConvTranspose2dConfig {
                padding: DECODER_PADDING[i],
                stride: 2,
                ..Default::default()
            };
            deconvs.push(init.conv_transpose2d(&format!("deconv_{}", i + 1), pair[0], pair[1], 4, cfg)?);
            if i != last {
                norms.push(init.batch_norm(&format!("de_bn_{}", i + 1), pair[1])?);
            }
        }

        Ok(Self {
            style_input,
            class_input,
            deconvs,
            norms,
            z_dim,
            s_dim,
            layers: init.finish(),
        })
    }

    /// `style`: `B×Z_DIM`, `class`: `B×S_DIM` -> `B×3×60×60`.
    pub fn forward(&self, style: &Tensor, class: &Tensor, train: bool) -> Result<Tensor> {
        expect_dims("decoder style input", style, &[None, Some(self.z_dim)])?;
        let batch = style.dim(0)?;
        expect_dims("decoder class input", class, &[Some(batch), Some(self.s_dim)])?;

        let style = leaky_relu(&style.apply(&self.style_input)?, LEAKY_SLOPE)?;
        let class = leaky_relu(&class.apply(&self.class_input)?, LEAKY_SLOPE)?;
        let mut x = Tensor::cat(&[&style, &class], 1)?.reshape((batch, DECODER_WIDTHS[0], 2, 2))?;

        for (i, deconv) in self.deconvs.iter().enumerate() {
            x = x.apply(deconv)?;
            if let Some(bn) = self.norms.get(i) {
                x = leaky_relu(&x.apply_t(bn, train)?, LEAKY_SLOPE)?;
            }
        }
        Ok(x)
    }

    pub fn layers(&self) -> &[(String, LayerKind)] {
        &self.layers
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Class predictor over a latent vector. Not used by the dual-cycle trainer;
/// available for semi-supervised extensions.
pub struct Classifier {
    fc: Vec<Linear>,
    norms: Vec<BatchNorm>,
    z_dim: usize,
}

impl Classifier {
    pub fn new(z_dim: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let mut init = LayerInit::new(vb);
        let fc = vec![
            init.linear("fc_1", z_dim, 256)?,
            init.linear("fc_2", 256, 256)?,
            init.linear("fc_3", 256, num_classes)?,
        ];
        let norms = vec![init.batch_norm("fc_1_bn", 256)?, init.batch_norm("fc_2_bn", 256)?];
        Ok(Self { fc, norms, z_dim })
    }

    /// Returns unnormalized class logits `B×num_classes`.
    pub fn forward(&self, z: &Tensor, train: bool) -> Result<Tensor> {
        expect_dims("classifier input", z, &[None, Some(self.z_dim)])?;
        let mut x = z.clone();
        for (i, fc) in self.fc.iter().enumerate() {
            x = x.apply(fc)?;
            if let Some(bn) = self.norms.get(i) {
                x = leaky_relu(&x.apply_t(bn, train)?, LEAKY_SLOPE)?;
            }
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn stats(t: &Tensor) -> Result<(f64, f64)> {
        let v: Vec<f32> = t.flatten_all()?.to_vec1()?;
        let n = v.len() as f64;
        let mean = v.iter().map(|&x| x as f64).sum::<f64>() / n;
        let var = v.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / n;
        Ok((mean, var.sqrt()))
    }

    fn var_named(varmap: &VarMap, name: &str) -> Tensor {
        let data = varmap.data().lock().unwrap();
        data.get(name)
            .unwrap_or_else(|| panic!("no var {name}"))
            .as_tensor()
            .clone()
    }

    #[test]
    fn test_encoder_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = Encoder::new(7, 5, vb)?;

        for batch in [1usize, 3] {
            let x = Tensor::randn(0f32, 1.0, (batch, 3, IMAGE_SIZE, IMAGE_SIZE), &device)?;
            let out = encoder.forward(&x, true)?;
            assert_eq!(out.style_mu.dims(), &[batch, 7]);
            assert_eq!(out.style_logvar.dims(), &[batch, 7]);
            assert_eq!(out.class_embedding.dims(), &[batch, 5]);
        }
        Ok(())
    }

    #[test]
    fn test_decoder_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = Decoder::new(7, 5, vb)?;

        let style = Tensor::randn(0f32, 1.0, (2, 7), &device)?;
        let class = Tensor::randn(0f32, 1.0, (2, 5), &device)?;
        let out = decoder.forward(&style, &class, true)?;
        assert_eq!(out.dims(), &[2, 3, IMAGE_SIZE, IMAGE_SIZE]);
        Ok(())
    }

    #[test]
    fn test_encoder_rejects_wrong_input() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let encoder = Encoder::new(4, 4, VarBuilder::from_varmap(&varmap, DType::F32, &device))?;

        // channel-last batch handed straight to the network
        let x = Tensor::zeros((2, IMAGE_SIZE, IMAGE_SIZE, 3), DType::F32, &device)?;
        let err = encoder.forward(&x, true).err().expect("must fail");
        match err.downcast_ref::<CycleVaeError>() {
            Some(CycleVaeError::ShapeMismatch { tensor, actual, .. }) => {
                assert_eq!(*tensor, "encoder input");
                assert_eq!(actual, &vec![2, IMAGE_SIZE, IMAGE_SIZE, 3]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_decoder_rejects_batch_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let decoder = Decoder::new(4, 4, VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
        let style = Tensor::zeros((2, 4), DType::F32, &device)?;
        let class = Tensor::zeros((3, 4), DType::F32, &device)?;
        let err = decoder.forward(&style, &class, true).err().expect("must fail");
        assert!(err.to_string().contains("decoder class input"), "{err}");
        Ok(())
    }

    #[test]
    fn test_init_policy() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let encoder = Encoder::new(16, 16, VarBuilder::from_varmap(&varmap, DType::F32, &device))?;

        let (mean, std) = stats(&var_named(&varmap, "conv_4.weight"))?;
        assert!(mean.abs() < 0.005, "conv mean {mean}");
        assert!((std - 0.05).abs() < 0.005, "conv std {std}");

        let (mean, std) = stats(&var_named(&varmap, "bn_4.weight"))?;
        assert!((mean - 1.0).abs() < 0.01, "norm scale mean {mean}");
        assert!(std < 0.05, "norm scale std {std}");

        for name in ["conv_1.bias", "bn_2.bias", "style_mu.bias", "class_output.bias"] {
            let (mean, std) = stats(&var_named(&varmap, name))?;
            assert_eq!((mean, std), (0.0, 0.0), "{name} should be zeroed");
        }

        let kinds: Vec<LayerKind> = encoder.layers().iter().map(|(_, k)| *k).collect();
        assert_eq!(kinds.iter().filter(|k| **k == LayerKind::Convolution).count(), 4);
        assert_eq!(kinds.iter().filter(|k| **k == LayerKind::Normalization).count(), 4);
        assert_eq!(kinds.iter().filter(|k| **k == LayerKind::Linear).count(), 3);
        Ok(())
    }

    #[test]
    fn test_decoder_layer_registry() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let decoder = Decoder::new(4, 4, VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
        let names: Vec<&str> = decoder.layers().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            ["style_input", "class_input", "deconv_1", "de_bn_1", "deconv_2", "de_bn_2", "deconv_3", "de_bn_3", "deconv_4"]
        );
        Ok(())
    }

    #[test]
    fn test_classifier_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let classifier = Classifier::new(8, 10, VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
        let z = Tensor::randn(0f32, 1.0, (4, 8), &device)?;
        assert_eq!(classifier.forward(&z, true)?.dims(), &[4, 10]);
        assert_eq!(classifier.forward(&z, false)?.dims(), &[4, 10]);
        Ok(())
    }
}
