//! Stochastic multi-crop augmentation pipeline
//!
//! Every iteration the candidate image is turned into `num_cutouts` randomly
//! sized and placed square crops, resized to the embedding model's input
//! resolution and normalized with its channel statistics. Scoring many views
//! instead of one keeps the optimization from latching onto a single
//! adversarial crop. Crop geometry is sampled host-side from a seedable RNG;
//! everything applied to the tensor (narrow, resize, normalize) stays
//! differentiable back to the candidate image.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::resample::{resample_lanczos, resize_bilinear};

/// Crop side length is `image_size * clip(N(0.8, 0.3), 0.5, 0.95)`.
const SIZE_MEAN: f64 = 0.8;
const SIZE_STD: f64 = 0.3;
const SIZE_MIN: f64 = 0.5;
const SIZE_MAX: f64 = 0.95;

/// How a crop gets to the embedding model's input resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    Nearest,
    Bilinear,
    /// Lanczos low-pass then bilinear sampling.
    Lanczos,
}

/// Differentiable augmentation pipeline.
#[derive(Debug)]
pub struct CutoutPipeline {
    num_cutouts: usize,
    image_size: usize,
    target_res: usize,
    mode: ResizeMode,
    center_bias: bool,
    center_focus: f64,
    mean: Tensor,
    std: Tensor,
    size_dist: Normal<f64>,
    rng: StdRng,
}

impl CutoutPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_cutouts: usize,
        image_size: usize,
        target_res: usize,
        mode: ResizeMode,
        center_bias: bool,
        center_focus: f64,
        mean: [f32; 3],
        std: [f32; 3],
        seed: Option<u64>,
        device: &Device,
    ) -> Result<Self> {
        if num_cutouts == 0 {
            bail!("cutout pipeline needs at least one view");
        }
        if center_focus <= 0.0 {
            bail!("center_focus must be positive, got {center_focus}");
        }
        let mean = Tensor::from_vec(mean.to_vec(), (1, 3, 1, 1), device)?;
        let std = Tensor::from_vec(std.to_vec(), (1, 3, 1, 1), device)?;
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let size_dist = Normal::new(SIZE_MEAN, SIZE_STD)?;
        Ok(Self {
            num_cutouts,
            image_size,
            target_res,
            mode,
            center_bias,
            center_focus,
            mean,
            std,
            size_dist,
            rng,
        })
    }

    fn sample_size(&mut self) -> usize {
        let frac = self.size_dist.sample(&mut self.rng).clamp(SIZE_MIN, SIZE_MAX);
        ((self.image_size as f64 * frac) as usize).max(1)
    }

    fn sample_offset(&mut self, max_offset: usize) -> usize {
        if max_offset == 0 {
            return 0;
        }
        if self.center_bias {
            let center = max_offset as f64 / 2.0;
            let std = center / self.center_focus;
            if let Ok(normal) = Normal::new(center, std) {
                let draw = normal.sample(&mut self.rng).round();
                if draw >= 0.0 && draw <= max_offset as f64 {
                    return draw as usize;
                }
            }
            // out of bounds: fall through to a uniform re-draw
        }
        self.rng.gen_range(0..=max_offset)
    }

    /// Produce the (num_cutouts, 3, target_res, target_res) normalized view
    /// batch for one candidate image of shape (1, 3, S, S).
    pub fn views(&mut self, image: &Tensor) -> Result<Tensor> {
        let mut pieces = Vec::with_capacity(self.num_cutouts);
        for _ in 0..self.num_cutouts {
            let size = self.sample_size();
            let max_offset = self.image_size - size;
            let oy = self.sample_offset(max_offset);
            let ox = self.sample_offset(max_offset);
            let crop = image.narrow(2, oy, size)?.narrow(3, ox, size)?;
            let resized = match self.mode {
                ResizeMode::Nearest => crop.upsample_nearest2d(self.target_res, self.target_res)?,
                ResizeMode::Bilinear => resize_bilinear(&crop, self.target_res, self.target_res)?,
                ResizeMode::Lanczos => resample_lanczos(&crop, self.target_res, self.target_res)?,
            };
            pieces.push(resized);
        }
        let batch = Tensor::cat(&pieces, 0)?;
        let normalized = batch.broadcast_sub(&self.mean)?.broadcast_div(&self.std)?;
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(image_size: usize, center_bias: bool) -> CutoutPipeline {
        CutoutPipeline::new(
            4,
            image_size,
            16,
            ResizeMode::Nearest,
            center_bias,
            2.0,
            [0.5; 3],
            [0.25; 3],
            Some(7),
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn crop_sizes_stay_within_documented_bounds() {
        let mut p = pipeline(512, false);
        for _ in 0..2000 {
            let size = p.sample_size();
            assert!(size >= (512.0 * SIZE_MIN) as usize, "size {size} too small");
            assert!(size <= (512.0 * SIZE_MAX) as usize + 1, "size {size} too large");
        }
    }

    #[test]
    fn offsets_never_leave_the_image() {
        for center_bias in [false, true] {
            let mut p = pipeline(128, center_bias);
            for _ in 0..2000 {
                let size = p.sample_size().min(128);
                let max_offset = 128 - size;
                let off = p.sample_offset(max_offset);
                assert!(off + size <= 128, "offset {off} + size {size} out of bounds");
            }
        }
    }

    #[test]
    fn views_have_batch_and_resolution_of_the_pipeline() {
        let img = Tensor::randn(0f32, 1f32, (1, 3, 64, 64), &Device::Cpu).unwrap();
        let mut p = CutoutPipeline::new(
            6,
            64,
            16,
            ResizeMode::Bilinear,
            false,
            2.0,
            [0.48145466, 0.4578275, 0.40821073],
            [0.26862954, 0.26130258, 0.27577711],
            Some(1),
            &Device::Cpu,
        )
        .unwrap();
        let views = p.views(&img).unwrap();
        assert_eq!(views.dims(), &[6, 3, 16, 16]);
    }

    #[test]
    fn seeded_pipelines_sample_identical_geometry() {
        let mut a = pipeline(256, false);
        let mut b = pipeline(256, false);
        for _ in 0..32 {
            assert_eq!(a.sample_size(), b.sample_size());
            assert_eq!(a.sample_offset(100), b.sample_offset(100));
        }
    }
}
