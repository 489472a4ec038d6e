//! CLI entry point for CLIP-guided BigGAN dreaming

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use slumber::biggan::{BigGan, BigGanConfig};
use slumber::clip::{Perceptor, PerceptorVariant, CLIP_MEAN, CLIP_STD};
use slumber::config::DreamConfig;
use slumber::cutouts::{CutoutPipeline, ResizeMode};
use slumber::device::select_device;
use slumber::download::ModelDownloader;
use slumber::dream::DreamModel;
use slumber::imagine::{CancelToken, Imagine};
use slumber::latents::{EmaLatents, Latents};
use slumber::output::OutputManager;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slumber")]
#[command(version)]
#[command(about = "Text-to-image generation by CLIP-guided BigGAN latent optimization", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download required models (~1-2GB)
    ///
    /// Fetches from HuggingFace Hub:
    /// - a CLIP checkpoint + tokenizer
    /// - the BigGAN-deep generator for the chosen image size
    ///
    /// None of the checkpoints are gated.
    Download {
        /// Image size the generator will be fetched for (128, 256 or 512)
        #[arg(long, default_value = "512")]
        image_size: usize,

        /// Fetch CLIP ViT-L/14 instead of ViT-B/32
        #[arg(long)]
        larger_clip: bool,
    },

    /// Optimize an image toward a text prompt
    Dream(DreamArgs),
}

#[derive(Args)]
struct DreamArgs {
    /// Text prompt; separate multiple phrases with "|"
    #[arg(short, long)]
    text: Option<String>,

    /// Text to steer away from, also "|"-separable
    #[arg(long, default_value = "")]
    text_min: String,

    /// Conditioning image, averaged into the prompt encoding
    #[arg(long)]
    img: Option<PathBuf>,

    /// Output side length: 128, 256 or 512
    #[arg(long, default_value = "512")]
    image_size: usize,

    /// Adam learning rate on the latents
    #[arg(long, default_value = "0.07")]
    lr: f64,

    #[arg(long, default_value = "20")]
    epochs: usize,

    #[arg(long, default_value = "1050")]
    iterations: usize,

    /// Checkpoint interval in iterations
    #[arg(long, default_value = "50")]
    save_every: usize,

    /// Micro-batches averaged into each optimizer step
    #[arg(long, default_value = "1")]
    gradient_accumulate_every: usize,

    /// Augmentation views scored per iteration
    #[arg(long, default_value = "128")]
    num_cutouts: usize,

    /// Seed for the device RNG and the crop sampler
    #[arg(long)]
    seed: Option<u64>,

    /// Append ".{seed}" to output file names
    #[arg(long)]
    append_seed: bool,

    /// Write a numbered progress image at every checkpoint
    #[arg(long)]
    save_progress: bool,

    /// Keep rewriting a ".best" image whenever the score improves
    #[arg(long)]
    save_best: bool,

    /// Prefix output names with a timestamp
    #[arg(long)]
    save_date_time: bool,

    /// Restrict the class mixture to a soft top-k of this many classes
    #[arg(long)]
    max_classes: Option<usize>,

    /// Softmax temperature for the differentiable top-k
    #[arg(long, default_value = "2.0")]
    class_temperature: f64,

    #[arg(long, default_value = "0.99")]
    ema_decay: f64,

    /// Sample crop offsets around the image center instead of uniformly
    #[arg(long)]
    center_bias: bool,

    /// Center-bias spread divisor; larger concentrates crops tighter
    #[arg(long, default_value = "2.0")]
    center_focus: f64,

    /// Bilinear cutout resizing instead of nearest
    #[arg(long)]
    bilinear: bool,

    /// Lanczos low-pass cutout resampling (experimental)
    #[arg(long)]
    experimental_resample: bool,

    /// Score with CLIP ViT-L/14 instead of ViT-B/32
    #[arg(long)]
    larger_clip: bool,

    /// Output directory (defaults to the working directory)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Quick preview: overrides the schedule with 10 epochs of 300
    /// iterations, 64 cutouts and a checkpoint every 25 iterations
    #[arg(long)]
    fast: bool,

    /// Replace an existing output file instead of refusing to start
    #[arg(long)]
    overwrite: bool,
}

impl DreamArgs {
    fn into_config(self) -> DreamConfig {
        let mut cfg = DreamConfig {
            text: self.text,
            text_min: self.text_min,
            img: self.img,
            image_size: self.image_size,
            lr: self.lr,
            epochs: self.epochs,
            iterations: self.iterations,
            save_every: self.save_every,
            gradient_accumulate_every: self.gradient_accumulate_every,
            num_cutouts: self.num_cutouts,
            seed: self.seed,
            append_seed: self.append_seed,
            save_progress: self.save_progress,
            save_best: self.save_best,
            save_date_time: self.save_date_time,
            max_classes: self.max_classes,
            class_temperature: self.class_temperature,
            ema_decay: self.ema_decay,
            center_bias: self.center_bias,
            center_focus: self.center_focus,
            bilinear: self.bilinear,
            experimental_resample: self.experimental_resample,
            larger_clip: self.larger_clip,
            output_dir: self.output_dir,
            ..Default::default()
        };
        if self.fast {
            cfg.epochs = 10;
            cfg.iterations = 300;
            cfg.num_cutouts = 64;
            cfg.save_every = 25;
        }
        cfg
    }
}

fn banner() {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        cuda = candle_core::utils::cuda_is_available(),
        metal = candle_core::utils::metal_is_available(),
        avx = candle_core::utils::with_avx(),
        "slumber starting"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Download {
            image_size,
            larger_clip,
        } => {
            // validate the size before fetching anything
            BigGanConfig::for_size(image_size)?;
            let variant = clip_variant(larger_clip);
            let downloader = ModelDownloader::new()?;
            let paths = downloader.download_all(variant, image_size).await?;
            info!("Model locations:");
            info!("  CLIP:   {}", paths.clip_safetensors.display());
            info!("  BigGAN: {}", paths.biggan_checkpoint.display());
        }

        Commands::Dream(args) => {
            let overwrite = args.overwrite;
            let cfg = args.into_config();
            dream(cfg, overwrite).await?;
        }
    }

    Ok(())
}

fn clip_variant(larger_clip: bool) -> PerceptorVariant {
    if larger_clip {
        PerceptorVariant::VitL14
    } else {
        PerceptorVariant::VitB32
    }
}

async fn dream(cfg: DreamConfig, overwrite: bool) -> Result<()> {
    cfg.validate()?;
    banner();

    let output = OutputManager::new(
        cfg.output_dir.clone(),
        cfg.text.as_deref(),
        &cfg.text_min,
        cfg.img.as_deref(),
        cfg.seed,
        cfg.append_seed,
        cfg.save_progress,
        cfg.save_best,
        cfg.save_date_time,
    )?;
    // checked before the downloads so a name clash fails in milliseconds
    let canonical = output.canonical_path();
    if canonical.exists() && !overwrite {
        bail!(
            "{} already exists, pass --overwrite to replace it",
            canonical.display()
        );
    }

    let device = select_device()?;
    if let Some(seed) = cfg.seed {
        device.set_seed(seed)?;
    }

    let variant = clip_variant(cfg.larger_clip);
    let gen_cfg = BigGanConfig::for_size(cfg.image_size)?;
    let downloader = ModelDownloader::new()?;
    let paths = downloader.download_all(variant, cfg.image_size).await?;

    let perceptor = Perceptor::load(
        &paths.clip_safetensors,
        &paths.clip_tokenizer,
        variant,
        &device,
    )?;
    let generator = BigGan::from_pth(&paths.biggan_checkpoint, gen_cfg.clone(), &device)?;

    let latents = Latents::new(
        gen_cfg.num_latents(),
        gen_cfg.z_dim,
        gen_cfg.num_classes,
        cfg.max_classes,
        cfg.class_temperature,
        &device,
    )?;
    let latents = EmaLatents::new(latents, cfg.ema_decay)?;

    let resize_mode = if cfg.experimental_resample {
        ResizeMode::Lanczos
    } else if cfg.bilinear {
        ResizeMode::Bilinear
    } else {
        ResizeMode::Nearest
    };
    let cutouts = CutoutPipeline::new(
        cfg.num_cutouts,
        cfg.image_size,
        variant.input_resolution(),
        resize_mode,
        cfg.center_bias,
        cfg.center_focus,
        CLIP_MEAN,
        CLIP_STD,
        cfg.seed,
        &device,
    )?;

    let model = DreamModel::new(generator, latents, cutouts, cfg.loss_coef);

    let cancel = CancelToken::new();
    let listener = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing the current iteration");
            listener.cancel();
        }
    });

    let mut imagine = Imagine::new(cfg, model, perceptor, output, cancel, device)?;
    let completed = tokio::task::spawn_blocking(move || imagine.run()).await??;
    if !completed {
        info!("run interrupted, the last checkpoint is final");
    }
    Ok(())
}
