//! Loss terms for the forward and reverse cycles. All functions are pure
//! tensor expressions, differentiable through candle's autograd.

use anyhow::Result;
use candle_core::Tensor;

use crate::config::{IMAGE_CHANNELS, IMAGE_SIZE};
use crate::error::CycleVaeError;

/// Reconstruction error is `RECONSTRUCTION_SCALE * mse`.
pub const RECONSTRUCTION_SCALE: f64 = 2.0;
/// KL term is `KL_SCALE * raw_kl / normalizer`.
pub const KL_SCALE: f64 = 3.0;
/// Reverse-cycle loss is amplified by this factor for the gradient step and
/// divided back out for logging.
pub const REVERSE_CYCLE_SCALE: f64 = 10.0;

fn same_shape(what: &'static str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.dims() != b.dims() {
        return Err(CycleVaeError::shape(what, format!("{:?}", a.dims()), b.dims()).into());
    }
    Ok(())
}

/// `sum((a - b)^2) / numel`.
pub fn mse_loss(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    same_shape("mse target", input, target)?;
    Ok((input - target)?.sqr()?.mean_all()?)
}

/// `sum(|a - b|) / numel`.
pub fn l1_loss(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    same_shape("l1 target", input, target)?;
    Ok((input - target)?.abs()?.mean_all()?)
}

pub fn reconstruction_loss(reconstruction: &Tensor, target: &Tensor) -> Result<Tensor> {
    Ok((mse_loss(reconstruction, target)? * RECONSTRUCTION_SCALE)?)
}

/// Gaussian KL against N(0, I): `-0.5 * sum(1 + logvar - mu^2 - exp(logvar))`.
/// Non-negative for every finite input, zero only at `mu = 0, logvar = 0`.
pub fn kl_divergence_raw(mu: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    same_shape("kl logvar", mu, logvar)?;
    let inner = (((logvar + 1.0)? - mu.sqr()?)? - logvar.exp()?)?;
    Ok((inner.sum_all()? * -0.5)?)
}

/// Divisor for the KL term: batch size times the per-image element count of a
/// 3×60×60 sprite.
pub fn kl_normalizer(batch_size: usize) -> f64 {
    (batch_size * IMAGE_CHANNELS * IMAGE_SIZE * IMAGE_SIZE) as f64
}

pub fn kl_divergence_loss(mu: &Tensor, logvar: &Tensor, normalizer: f64) -> Result<Tensor> {
    let raw = kl_divergence_raw(mu, logvar)?;
    Ok(((raw * KL_SCALE)? / normalizer)?)
}

/// Amplified consistency loss between two recovered style means.
pub fn reverse_cycle_loss(z_1: &Tensor, z_2: &Tensor) -> Result<Tensor> {
    Ok((l1_loss(z_1, z_2)? * REVERSE_CYCLE_SCALE)?)
}

/// Values reported for one forward-cycle step, already combined the way
/// the epoch statistics expect them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ForwardLosses {
    /// `(kl_1 + kl_2) / 3`
    pub kl_divergence: f32,
    /// `(rec_1 + rec_2) / 2`
    pub reconstruction: f32,
}

impl ForwardLosses {
    pub fn combine(kl: [f32; 2], reconstruction: [f32; 2]) -> Self {
        Self {
            kl_divergence: (kl[0] + kl[1]) / 3.0,
            reconstruction: (reconstruction[0] + reconstruction[1]) / 2.0,
        }
    }
}

/// Reverse-cycle loss with the amplification removed.
pub fn logged_reverse_cycle(amplified: f32) -> f32 {
    amplified / REVERSE_CYCLE_SCALE as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn scalar(t: &Tensor) -> Result<f32> {
        Ok(t.to_scalar::<f32>()?)
    }

    #[test]
    fn test_mse_symmetric_and_zero_on_self() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::randn(0f32, 1.0, (2, 3, 4, 4), &device)?;
        let b = Tensor::randn(0f32, 1.0, (2, 3, 4, 4), &device)?;
        assert_eq!(scalar(&mse_loss(&a, &b)?)?, scalar(&mse_loss(&b, &a)?)?);
        assert_eq!(scalar(&mse_loss(&a, &a)?)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_mse_and_l1_values() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::new(&[1f32, 2.0, 3.0, 4.0], &device)?;
        let b = Tensor::new(&[1f32, 0.0, 3.0, 8.0], &device)?;
        // diffs 0, 2, 0, -4
        assert!((scalar(&mse_loss(&a, &b)?)? - 5.0).abs() < 1e-6);
        assert!((scalar(&l1_loss(&a, &b)?)? - 1.5).abs() < 1e-6);
        assert!((scalar(&reconstruction_loss(&a, &b)?)? - 10.0).abs() < 1e-6);
        assert!((scalar(&reverse_cycle_loss(&a, &b)?)? - 15.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_reported() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::zeros((2, 3), DType::F32, &device)?;
        let b = Tensor::zeros((3, 2), DType::F32, &device)?;
        assert!(mse_loss(&a, &b).is_err());
        assert!(l1_loss(&a, &b).is_err());
        Ok(())
    }

    #[test]
    fn test_kl_zero_at_prior() -> Result<()> {
        let device = Device::Cpu;
        let zeros = Tensor::zeros((4, 6), DType::F32, &device)?;
        assert_eq!(scalar(&kl_divergence_raw(&zeros, &zeros)?)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_kl_non_negative() -> Result<()> {
        let device = Device::Cpu;
        for scale in [0.01f64, 0.5, 2.0, 4.0] {
            let mu = Tensor::randn(0f32, scale as f32, (8, 5), &device)?;
            let logvar = Tensor::randn(0f32, scale as f32, (8, 5), &device)?;
            let kl = scalar(&kl_divergence_raw(&mu, &logvar)?)?;
            assert!(kl > 0.0, "kl {kl} at scale {scale}");
        }
        // only one element away from the prior
        let mu = Tensor::new(&[[0f32, 0.0], [0.0, 0.3]], &device)?;
        let logvar = Tensor::zeros((2, 2), DType::F32, &device)?;
        let kl = scalar(&kl_divergence_raw(&mu, &logvar)?)?;
        assert!((kl - 0.5 * 0.09).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_kl_loss_scaling() -> Result<()> {
        let device = Device::Cpu;
        let mu = Tensor::ones((2, 4), DType::F32, &device)?;
        let logvar = Tensor::zeros((2, 4), DType::F32, &device)?;
        // raw = 0.5 * 8 = 4
        let norm = kl_normalizer(2);
        assert_eq!(norm, 2.0 * 3.0 * 60.0 * 60.0);
        let kl = scalar(&kl_divergence_loss(&mu, &logvar, norm)?)?;
        assert!((kl as f64 - 12.0 / norm).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_logged_combinations() {
        let fwd = ForwardLosses::combine([0.3, 0.6], [1.0, 3.0]);
        assert!((fwd.kl_divergence - 0.3).abs() < 1e-6);
        assert!((fwd.reconstruction - 2.0).abs() < 1e-6);
        assert!((logged_reverse_cycle(2.5) - 0.25).abs() < 1e-7);
    }
}
