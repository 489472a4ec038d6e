//! Text-to-image generation by CLIP-guided latent optimization
//!
//! Instead of sampling a generative model once, this crate searches its input
//! space: the latent inputs of a pretrained BigGAN-deep generator are
//! optimized with Adam until CLIP judges the generated image similar to a
//! text prompt. Both models stay frozen; the only trainable values are one
//! noise vector and one row of class logits per generator layer.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use slumber::biggan::{BigGan, BigGanConfig};
//! use slumber::clip::{Perceptor, PerceptorVariant, CLIP_MEAN, CLIP_STD};
//! use slumber::config::DreamConfig;
//! use slumber::cutouts::{CutoutPipeline, ResizeMode};
//! use slumber::download::ModelDownloader;
//! use slumber::dream::DreamModel;
//! use slumber::imagine::{CancelToken, Imagine};
//! use slumber::latents::{EmaLatents, Latents};
//! use slumber::output::OutputManager;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cfg = DreamConfig {
//!         text: Some("a pyramid made of ice".to_string()),
//!         ..Default::default()
//!     };
//!     cfg.validate()?;
//!
//!     let device = slumber::device::select_device()?;
//!     let paths = ModelDownloader::new()?
//!         .download_all(PerceptorVariant::VitB32, cfg.image_size)
//!         .await?;
//!
//!     let gen_cfg = BigGanConfig::for_size(cfg.image_size)?;
//!     let generator = BigGan::from_pth(&paths.biggan_checkpoint, gen_cfg.clone(), &device)?;
//!     let perceptor = Perceptor::load(
//!         &paths.clip_safetensors,
//!         &paths.clip_tokenizer,
//!         PerceptorVariant::VitB32,
//!         &device,
//!     )?;
//!
//!     let latents = Latents::new(
//!         gen_cfg.num_latents(),
//!         gen_cfg.z_dim,
//!         gen_cfg.num_classes,
//!         cfg.max_classes,
//!         cfg.class_temperature,
//!         &device,
//!     )?;
//!     let latents = EmaLatents::new(latents, cfg.ema_decay)?;
//!     let cutouts = CutoutPipeline::new(
//!         cfg.num_cutouts,
//!         cfg.image_size,
//!         PerceptorVariant::VitB32.input_resolution(),
//!         ResizeMode::Nearest,
//!         cfg.center_bias,
//!         cfg.center_focus,
//!         CLIP_MEAN,
//!         CLIP_STD,
//!         cfg.seed,
//!         &device,
//!     )?;
//!
//!     let model = DreamModel::new(generator, latents, cutouts, cfg.loss_coef);
//!     let output = OutputManager::new(
//!         cfg.output_dir.clone(),
//!         cfg.text.as_deref(),
//!         &cfg.text_min,
//!         None,
//!         cfg.seed,
//!         cfg.append_seed,
//!         cfg.save_progress,
//!         cfg.save_best,
//!         cfg.save_date_time,
//!     )?;
//!     let mut imagine = Imagine::new(
//!         cfg, model, perceptor, output, CancelToken::new(), device,
//!     )?;
//!     imagine.run()?;
//!     Ok(())
//! }
//! ```

pub mod biggan;
pub mod clip;
pub mod config;
pub mod cutouts;
pub mod device;
pub mod download;
pub mod dream;
pub mod ema;
pub mod imagine;
pub mod latents;
pub mod loss;
pub mod output;
pub mod resample;
