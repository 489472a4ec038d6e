//! Run configuration for a single generation run
//!
//! All knobs are fixed for the lifetime of one `Imagine` invocation. Defaults
//! match the reference settings that produce good 512px results on a single
//! accelerator card.

use anyhow::{bail, Result};
use std::path::PathBuf;

/// Image sizes the BigGAN-deep checkpoints exist for.
pub const VALID_IMAGE_SIZES: [usize; 3] = [128, 256, 512];

/// Configuration bundle for one generation run.
#[derive(Debug, Clone)]
pub struct DreamConfig {
    /// Text prompt. Multiple phrases can be separated with "|".
    pub text: Option<String>,
    /// Text to steer away from (similarity is minimized). Also "|"-splittable.
    pub text_min: String,
    /// Optional conditioning image, averaged into the prompt encoding.
    pub img: Option<PathBuf>,
    /// Output image side length. Must be one of 128, 256 or 512.
    pub image_size: usize,
    /// Adam learning rate on the latents.
    pub lr: f64,
    pub epochs: usize,
    pub iterations: usize,
    /// Checkpoint interval in iterations.
    pub save_every: usize,
    /// Micro-batches averaged into each optimizer step.
    pub gradient_accumulate_every: usize,
    /// Number of augmentation views scored per iteration.
    pub num_cutouts: usize,
    pub seed: Option<u64>,
    /// Append ".{seed}" to output file names.
    pub append_seed: bool,
    /// Write a numbered progress image at every checkpoint.
    pub save_progress: bool,
    /// Keep rewriting a ".best" image whenever the checkpoint score improves.
    pub save_best: bool,
    /// Prefix output names with a timestamp.
    pub save_date_time: bool,
    /// Restrict the class distribution to a soft top-k of this many classes.
    pub max_classes: Option<usize>,
    /// Softmax temperature for the differentiable top-k.
    pub class_temperature: f64,
    pub ema_decay: f64,
    /// Sample crop offsets around the image center instead of uniformly.
    pub center_bias: bool,
    /// Center-bias spread divisor; larger values concentrate crops tighter.
    pub center_focus: f64,
    /// Bilinear resize for cutouts instead of nearest.
    pub bilinear: bool,
    /// Lanczos low-pass resampling for cutouts.
    pub experimental_resample: bool,
    /// Use CLIP ViT-L/14 instead of ViT-B/32.
    pub larger_clip: bool,
    pub output_dir: Option<PathBuf>,
    /// Fixed coefficient on the similarity terms.
    pub loss_coef: f64,
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self {
            text: None,
            text_min: String::new(),
            img: None,
            image_size: 512,
            lr: 0.07,
            epochs: 20,
            iterations: 1050,
            save_every: 50,
            gradient_accumulate_every: 1,
            num_cutouts: 128,
            seed: None,
            append_seed: false,
            save_progress: false,
            save_best: false,
            save_date_time: false,
            max_classes: None,
            class_temperature: 2.0,
            ema_decay: 0.99,
            center_bias: false,
            center_focus: 2.0,
            bilinear: false,
            experimental_resample: false,
            larger_clip: false,
            output_dir: None,
            loss_coef: 100.0,
        }
    }
}

impl DreamConfig {
    /// Validate everything that can be checked without touching model weights.
    ///
    /// Called before any download or load so that a bad flag fails in
    /// milliseconds rather than after a multi-gigabyte fetch.
    pub fn validate(&self) -> Result<()> {
        if !VALID_IMAGE_SIZES.contains(&self.image_size) {
            bail!(
                "image size must be one of 128, 256 or 512, got {}",
                self.image_size
            );
        }
        if self.text.is_none() && self.img.is_none() {
            bail!("nothing to generate: provide a text prompt, an image, or both");
        }
        if self.iterations == 0 || self.epochs == 0 {
            bail!("epochs and iterations must be non-zero");
        }
        if self.save_every == 0 {
            bail!("save_every must be non-zero");
        }
        if self.gradient_accumulate_every == 0 {
            bail!("gradient_accumulate_every must be non-zero");
        }
        if self.num_cutouts == 0 {
            bail!("num_cutouts must be non-zero");
        }
        if self.ema_decay <= 0.0 || self.ema_decay >= 1.0 {
            bail!("ema_decay must lie in (0, 1), got {}", self.ema_decay);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_with_text_is_valid() {
        let cfg = DreamConfig {
            text: Some("a pyramid made of ice".to_string()),
            ..Default::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_invalid_image_size() {
        let cfg = DreamConfig {
            text: Some("x".to_string()),
            image_size: 384,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("image size"));
    }

    #[test]
    fn rejects_empty_prompt() {
        let cfg = DreamConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_degenerate_ema_decay() {
        for decay in [0.0, 1.0, -0.5] {
            let cfg = DreamConfig {
                text: Some("x".to_string()),
                ema_decay: decay,
                ..Default::default()
            };
            assert!(cfg.validate().is_err(), "decay {decay}");
        }
    }
}
