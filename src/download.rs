//! Model downloader for HuggingFace Hub
//!
//! Fetches the two frozen models a run needs:
//! - a CLIP checkpoint with its tokenizer (~600MB for ViT-B/32, ~1.7GB for
//!   ViT-L/14)
//! - a BigGAN-deep generator checkpoint for the chosen size (~200-350MB)
//!
//! Everything goes through the hub cache, so repeated runs are free.

use anyhow::{Context, Result};
use hf_hub::api::tokio::Api;
use std::path::PathBuf;
use tracing::info;

use crate::clip::PerceptorVariant;

/// Model downloader that caches models using HuggingFace Hub
pub struct ModelDownloader {
    api: Api,
}

/// Paths to all downloaded models
pub struct ModelPaths {
    pub clip_safetensors: PathBuf,
    pub clip_tokenizer: PathBuf,
    pub biggan_checkpoint: PathBuf,
}

fn biggan_repo_id(image_size: usize) -> String {
    format!("osanseviero/BigGAN-deep-{image_size}")
}

impl ModelDownloader {
    /// Create a new model downloader
    ///
    /// Uses HF_TOKEN environment variable if set, but none of the
    /// checkpoints are gated.
    pub fn new() -> Result<Self> {
        let api = Api::new().context("Failed to create HuggingFace API client")?;
        Ok(Self { api })
    }

    /// Download everything a run with this CLIP variant and image size needs.
    pub async fn download_all(
        &self,
        variant: PerceptorVariant,
        image_size: usize,
    ) -> Result<ModelPaths> {
        info!("Downloading CLIP and BigGAN-deep checkpoints");

        let ((clip_safetensors, clip_tokenizer), biggan_checkpoint) = tokio::try_join!(
            self.download_clip(variant),
            self.download_biggan(image_size)
        )?;

        info!("✓ All models downloaded successfully!");

        Ok(ModelPaths {
            clip_safetensors,
            clip_tokenizer,
            biggan_checkpoint,
        })
    }

    /// Download a CLIP checkpoint plus its tokenizer.
    pub async fn download_clip(&self, variant: PerceptorVariant) -> Result<(PathBuf, PathBuf)> {
        info!("Downloading CLIP ({})", variant.repo_id());

        let repo = self
            .api
            .repo(hf_hub::Repo::model(variant.repo_id().to_string()));
        let weights = repo
            .get("model.safetensors")
            .await
            .context("Failed to download CLIP weights")?;
        let tokenizer = repo
            .get("tokenizer.json")
            .await
            .context("Failed to download CLIP tokenizer")?;

        info!("  ✓ CLIP downloaded: {}", weights.display());
        Ok((weights, tokenizer))
    }

    /// Download the BigGAN-deep generator for one image size.
    pub async fn download_biggan(&self, image_size: usize) -> Result<PathBuf> {
        let repo_id = biggan_repo_id(image_size);
        info!("Downloading BigGAN-deep ({repo_id})");

        let repo = self.api.repo(hf_hub::Repo::model(repo_id));
        let path = repo
            .get("pytorch_model.bin")
            .await
            .context("Failed to download BigGAN checkpoint")?;

        info!("  ✓ BigGAN-deep downloaded: {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn biggan_repos_follow_the_published_naming() {
        assert_eq!(biggan_repo_id(128), "osanseviero/BigGAN-deep-128");
        assert_eq!(biggan_repo_id(512), "osanseviero/BigGAN-deep-512");
    }
}
