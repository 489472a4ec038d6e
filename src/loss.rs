//! Composite loss assembly
//!
//! Three additive, unitless terms: a latent regularizer pushing every noise
//! vector toward a standard-normal shape, a class regularizer penalizing
//! probability mass leaking outside the committed class, and the CLIP
//! similarity term computed by the scorer. They are kept separate so the
//! checkpoint logic can rank candidates by similarity alone.

use anyhow::Result;
use candle_core::{Tensor, D};

/// The three loss components of one iteration, pre-summation.
#[derive(Debug)]
pub struct LossTerms {
    /// Latent-shape regularization.
    pub lat: Tensor,
    /// Class leak regularization.
    pub cls: Tensor,
    /// Text/image similarity term (negative when similarity is rewarded).
    pub sim: Tensor,
}

impl LossTerms {
    /// The scalar backpropagation target.
    pub fn total(&self) -> Result<Tensor> {
        let t = ((&self.lat + &self.cls)? + &self.sim)?;
        Ok(t)
    }
}

/// Regularize the (N, Z) noise matrix toward N rows of standard normals.
///
/// `mean |1 - std| + mean |mean| + 4 * max(mean z^2, 1)` plus the mean over
/// rows of |skewness| and |excess kurtosis|. Without this the optimizer walks
/// the latents far outside the generator's training distribution and the
/// output collapses.
pub fn latent_reg(noise: &Tensor) -> Result<Tensor> {
    let (_n, z) = noise.dims2()?;

    let mean = noise.mean_keepdim(D::Minus1)?;
    let diffs = noise.broadcast_sub(&mean)?;

    // unbiased std for the spread term
    let std = (diffs.sqr()?.sum_keepdim(D::Minus1)? / (z as f64 - 1.0))?.sqrt()?;
    let term_std = std.affine(-1.0, 1.0)?.abs()?.mean_all()?;
    let term_mean = mean.abs()?.mean_all()?;
    let term_energy = (noise.sqr()?.mean_all()?.maximum(1f64)? * 4.0)?;

    // higher moments use the biased variance, matching the z-score definition
    let var_b = diffs.sqr()?.mean_keepdim(D::Minus1)?;
    let zscores = diffs.broadcast_div(&var_b.sqrt()?)?;
    let skew = zscores.powf(3.0)?.mean(D::Minus1)?;
    let kurt = (zscores.powf(4.0)?.mean(D::Minus1)? - 3.0)?;
    let term_moments = (skew.abs()? + kurt.abs()?)?.mean_all()?;

    let total = (((term_std + term_mean)? + term_energy)? + term_moments)?;
    Ok(total)
}

/// Penalize class-gate mass everywhere except each row's strongest class:
/// the per-row mean of `(50 * gate)^2` over all gates but the maximum.
///
/// Gates are non-negative (sigmoid or top-k output), so excluding the max of
/// the squares excludes the max gate.
pub fn class_reg(classes: &Tensor) -> Result<Tensor> {
    let (_n, c) = classes.dims2()?;
    if c < 2 {
        return classes.sum_all()?.zeros_like().map_err(Into::into);
    }
    let sq = (classes * 50.0)?.sqr()?;
    let total = sq.sum(D::Minus1)?;
    let row_max = sq.max(D::Minus1)?;
    let leak = ((total - row_max)? / (c as f64 - 1.0))?;
    Ok(leak.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn class_reg_ignores_the_strongest_gate() {
        // one row, gates 0.1 and 0.2: only (50 * 0.1)^2 = 25 should count
        let classes = Tensor::new(&[[0.1f32, 0.2]], &Device::Cpu).unwrap();
        let leak = class_reg(&classes).unwrap().to_scalar::<f32>().unwrap();
        assert!((leak - 25.0).abs() < 1e-4, "leak {leak}");
    }

    #[test]
    fn class_reg_averages_over_rows_and_gates() {
        let classes = Tensor::new(&[[0.0f32, 0.0, 1.0], [0.02, 0.0, 0.5]], &Device::Cpu).unwrap();
        // row 0: (0 + 0) / 2 = 0; row 1: ((50*0.02)^2 + 0) / 2 = 0.5
        let leak = class_reg(&classes).unwrap().to_scalar::<f32>().unwrap();
        assert!((leak - 0.25).abs() < 1e-4, "leak {leak}");
    }

    #[test]
    fn standard_normal_latents_score_close_to_the_energy_floor() {
        // for N(0,1) rows the spread/mean/moment terms vanish and the energy
        // term clamps at its threshold, leaving ~4.0
        let noise = Tensor::randn(0f32, 1f32, (8, 4096), &Device::Cpu).unwrap();
        let reg = latent_reg(&noise).unwrap().to_scalar::<f32>().unwrap();
        assert!((reg - 4.0).abs() < 0.4, "latent reg {reg}");
    }

    #[test]
    fn inflated_latents_are_penalized() {
        let calm = Tensor::randn(0f32, 1f32, (4, 1024), &Device::Cpu).unwrap();
        let wild = (calm.clone() * 5.0).unwrap();
        let calm_reg = latent_reg(&calm).unwrap().to_scalar::<f32>().unwrap();
        let wild_reg = latent_reg(&wild).unwrap().to_scalar::<f32>().unwrap();
        assert!(wild_reg > calm_reg + 1.0, "calm {calm_reg}, wild {wild_reg}");
    }

    #[test]
    fn total_sums_all_three_terms() {
        let dev = Device::Cpu;
        let terms = LossTerms {
            lat: Tensor::new(1.5f32, &dev).unwrap(),
            cls: Tensor::new(0.25f32, &dev).unwrap(),
            sim: Tensor::new(-3.0f32, &dev).unwrap(),
        };
        let total = terms.total().unwrap().to_scalar::<f32>().unwrap();
        assert!((total - (-1.25)).abs() < 1e-6);
    }
}
