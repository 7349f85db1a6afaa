use anyhow::Result;
use candle_core::{Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Source of latent style samples: the reparameterization step and draws from
/// the N(0, I) prior. Noise comes from a seeded host RNG so latent draws
/// replay exactly on every device; weight initialization is not covered.
pub struct LatentSampler {
    rng: StdRng,
}

impl LatentSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `mu + eps * exp(0.5 * logvar)` with `eps ~ N(0, I)` when `training`;
    /// otherwise `mu` itself. The noise is a constant, so gradients reach
    /// `mu` and `logvar` through the affine combination.
    pub fn reparameterize(&mut self, training: bool, mu: &Tensor, logvar: &Tensor) -> Result<Tensor> {
        if !training {
            return Ok(mu.clone());
        }
        let std = (logvar * 0.5)?.exp()?;
        let eps = self.standard_normal(mu.shape().clone(), mu.device())?;
        Ok((eps.mul(&std)? + mu)?)
    }

    /// Independent `N(0, 1)` draws of shape `(batch_size, dim)`, detached from
    /// any graph.
    pub fn sample_prior(&mut self, batch_size: usize, dim: usize, device: &Device) -> Result<Tensor> {
        self.standard_normal(Shape::from((batch_size, dim)), device)
    }

    fn standard_normal(&mut self, shape: Shape, device: &Device) -> Result<Tensor> {
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(data, shape, device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_eval_mode_returns_mu_exactly() -> Result<()> {
        let device = Device::Cpu;
        let mu = Tensor::new(&[[0.5f32, -1.25, 3.0], [7.0, 0.0, -0.001]], &device)?;
        for seed in [0u64, 1, 99] {
            let mut sampler = LatentSampler::new(seed);
            let logvar = Tensor::randn(0f32, 5.0, (2, 3), &device)?;
            let z = sampler.reparameterize(false, &mu, &logvar)?;
            assert_eq!(z.to_vec2::<f32>()?, mu.to_vec2::<f32>()?);
        }
        Ok(())
    }

    #[test]
    fn test_training_mode_moments() -> Result<()> {
        let device = Device::Cpu;
        let n = 20_000;
        let mu = Tensor::full(1.5f32, (n, 1), &device)?;
        let logvar = Tensor::zeros((n, 1), DType::F32, &device)?;
        let mut sampler = LatentSampler::new(42);
        let z = sampler.reparameterize(true, &mu, &logvar)?.flatten_all()?.to_vec1::<f32>()?;

        let mean = z.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
        let var = z.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        assert!((mean - 1.5).abs() < 0.05, "empirical mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "empirical variance {var}");
        Ok(())
    }

    #[test]
    fn test_training_mode_scales_by_logvar() -> Result<()> {
        let device = Device::Cpu;
        let n = 20_000;
        let mu = Tensor::zeros((n, 1), DType::F32, &device)?;
        // logvar = ln 4  =>  std = 2
        let logvar = Tensor::full(4f32.ln(), (n, 1), &device)?;
        let mut sampler = LatentSampler::new(5);
        let z = sampler.reparameterize(true, &mu, &logvar)?.flatten_all()?.to_vec1::<f32>()?;
        let var = z.iter().map(|&v| (v as f64).powi(2)).sum::<f64>() / n as f64;
        assert!((var - 4.0).abs() < 0.2, "empirical variance {var}");
        Ok(())
    }

    #[test]
    fn test_reparameterize_is_differentiable() -> Result<()> {
        let device = Device::Cpu;
        let mu = candle_core::Var::zeros((3, 2), DType::F32, &device)?;
        let logvar = candle_core::Var::zeros((3, 2), DType::F32, &device)?;
        let mut sampler = LatentSampler::new(3);
        let z = sampler.reparameterize(true, mu.as_tensor(), logvar.as_tensor())?;
        let grads = z.sum_all()?.backward()?;
        assert!(grads.get(mu.as_tensor()).is_some());
        assert!(grads.get(logvar.as_tensor()).is_some());
        Ok(())
    }

    #[test]
    fn test_prior_shape_and_seed_replay() -> Result<()> {
        let device = Device::Cpu;
        let a = LatentSampler::new(11).sample_prior(4, 6, &device)?;
        let b = LatentSampler::new(11).sample_prior(4, 6, &device)?;
        assert_eq!(a.dims(), &[4, 6]);
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
        assert!(!a.is_variable());
        Ok(())
    }
}
