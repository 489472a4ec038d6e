//! Joint text/image embedding scorer
//!
//! Wraps the CLIP model from candle-transformers. Text phrases are embedded
//! once per prompt change and cached in a `PromptSet`; image views are
//! embedded every iteration with gradients flowing back through the vision
//! tower into the candidate image. Similarity terms carry a fixed coefficient
//! and a sign: "max" phrases are rewarded, "min" phrases penalized.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{self, text_model, vision_model};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::info;

/// CLIP's fixed per-channel input statistics.
pub const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
pub const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

const CONTEXT_LENGTH: usize = 77;
const EOT_TOKEN: &str = "<|endoftext|>";

/// Which CLIP checkpoint backs the scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerceptorVariant {
    /// ViT-B/32, the default.
    VitB32,
    /// ViT-L/14, heavier but noticeably better prompt adherence.
    VitL14,
}

impl PerceptorVariant {
    pub fn repo_id(&self) -> &'static str {
        match self {
            Self::VitB32 => "openai/clip-vit-base-patch32",
            Self::VitL14 => "openai/clip-vit-large-patch14",
        }
    }

    /// Native input resolution of the vision tower.
    pub fn input_resolution(&self) -> usize {
        224
    }

    fn config(&self) -> clip::ClipConfig {
        match self {
            Self::VitB32 => clip::ClipConfig::vit_base_patch32(),
            Self::VitL14 => clip::ClipConfig {
                text_config: text_model::ClipTextConfig {
                    vocab_size: 49408,
                    embed_dim: 768,
                    activation: text_model::Activation::QuickGelu,
                    intermediate_size: 3072,
                    max_position_embeddings: CONTEXT_LENGTH,
                    pad_with: Some(EOT_TOKEN.to_string()),
                    num_hidden_layers: 12,
                    num_attention_heads: 12,
                    projection_dim: 768,
                },
                vision_config: vision_model::ClipVisionConfig {
                    embed_dim: 1024,
                    activation: text_model::Activation::QuickGelu,
                    intermediate_size: 4096,
                    num_hidden_layers: 24,
                    num_attention_heads: 16,
                    projection_dim: 768,
                    num_channels: 3,
                    image_size: 224,
                    patch_size: 14,
                },
                logit_scale_init_value: 2.6592,
                image_size: 224,
            },
        }
    }
}

/// The embedding model plus its tokenizer, frozen for the run.
pub struct Perceptor {
    model: clip::ClipModel,
    tokenizer: Tokenizer,
    device: Device,
    variant: PerceptorVariant,
}

impl Perceptor {
    pub fn load<P: AsRef<Path>>(
        weights: P,
        tokenizer_path: P,
        variant: PerceptorVariant,
        device: &Device,
    ) -> Result<Self> {
        info!(
            path = %weights.as_ref().display(),
            ?variant,
            "Loading CLIP perceptor"
        );
        let tokenizer = Tokenizer::from_file(tokenizer_path.as_ref())
            .map_err(|e| anyhow!("failed to load CLIP tokenizer: {e}"))?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights.as_ref()], DType::F32, device)?
        };
        let model = clip::ClipModel::new(vb, &variant.config())
            .context("failed to build CLIP model")?;
        info!("✓ CLIP perceptor loaded");
        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
            variant,
        })
    }

    fn tokenize(&self, text: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("tokenization failed: {e}"))?;
        let mut tokens = encoding.get_ids().to_vec();
        let pad_id = self
            .tokenizer
            .token_to_id(EOT_TOKEN)
            .ok_or_else(|| anyhow!("tokenizer is missing the {EOT_TOKEN} token"))?;
        tokens.truncate(CONTEXT_LENGTH);
        tokens.resize(CONTEXT_LENGTH, pad_id);
        let ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(ids)
    }

    /// Embed one text phrase. Detached: prompt embeddings are constants for
    /// the whole run.
    pub fn embed_text(&self, text: &str) -> Result<Tensor> {
        let ids = self.tokenize(text)?;
        let features = self.model.get_text_features(&ids)?;
        Ok(features.detach())
    }

    /// Embed a batch of normalized image views, gradient-tracked.
    pub fn embed_views(&self, views: &Tensor) -> Result<Tensor> {
        Ok(self.model.get_image_features(views)?)
    }

    /// Embed an image file for prompt conditioning: shorter-side resize,
    /// center crop, CLIP normalization, then a detached forward pass.
    pub fn embed_image_file<P: AsRef<Path>>(&self, path: P) -> Result<Tensor> {
        let res = self.variant.input_resolution();
        let img = image::ImageReader::open(path.as_ref())
            .with_context(|| format!("failed to open {}", path.as_ref().display()))?
            .decode()
            .context("failed to decode conditioning image")?
            .resize_to_fill(res as u32, res as u32, image::imageops::FilterType::Triangle)
            .to_rgb8();
        let data: Vec<f32> = img.into_raw().into_iter().map(|v| v as f32 / 255.0).collect();
        let pixels = Tensor::from_vec(data, (res, res, 3), &self.device)?
            .permute((2, 0, 1))?
            .unsqueeze(0)?;
        let mean = Tensor::from_vec(CLIP_MEAN.to_vec(), (1, 3, 1, 1), &self.device)?;
        let std = Tensor::from_vec(CLIP_STD.to_vec(), (1, 3, 1, 1), &self.device)?;
        let normalized = pixels.broadcast_sub(&mean)?.broadcast_div(&std)?;
        let features = self.model.get_image_features(&normalized)?;
        Ok(features.detach())
    }
}

/// Cosine similarity along the last dimension, broadcasting the smaller side.
pub fn cosine_similarity(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let normalize = |t: &Tensor| -> Result<Tensor> {
        let norm = t.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
        Ok(t.broadcast_div(&norm)?)
    };
    let a = normalize(a)?;
    let b = normalize(b)?;
    Ok(a.broadcast_mul(&b)?.sum(D::Minus1)?)
}

/// Whether a phrase's similarity is maximized or minimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    Max,
    Min,
}

/// Per-view similarity scores for one phrase: `-coef * cos` for max phrases
/// (minimizing drives similarity up), `+coef * cos` for min phrases.
pub fn view_scores(
    text_embed: &Tensor,
    image_embeds: &Tensor,
    mode: SimMode,
    coef: f64,
) -> Result<Tensor> {
    let cos = cosine_similarity(text_embed, image_embeds)?;
    let scores = match mode {
        SimMode::Max => (cos * (-coef))?,
        SimMode::Min => (cos * coef)?,
    };
    Ok(scores)
}

/// Split a prompt on "|" into trimmed, non-empty phrases.
pub fn split_phrases(text: &str) -> Vec<&str> {
    text.split('|')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Cached prompt embeddings for one generation run. Replaced wholesale when
/// the prompt changes.
pub struct PromptSet {
    /// Phrases whose similarity is maximized.
    pub max: Vec<Tensor>,
    /// Phrases whose similarity is minimized.
    pub min: Vec<Tensor>,
}

impl PromptSet {
    /// Embed a prompt (and optional negative prompt) once. When an image
    /// encoding is given it is averaged into every text phrase; with no text
    /// at all it becomes the sole max target.
    pub fn encode(
        perceptor: &Perceptor,
        text: Option<&str>,
        text_min: &str,
        image_encoding: Option<&Tensor>,
    ) -> Result<Self> {
        let embed_phrase = |phrase: &str| -> Result<Tensor> {
            let enc = perceptor.embed_text(phrase)?;
            match image_encoding {
                Some(img) => Ok(((enc + img)? / 2.0)?.detach()),
                None => Ok(enc),
            }
        };

        let mut max = Vec::new();
        if let Some(text) = text {
            for phrase in split_phrases(text) {
                max.push(embed_phrase(phrase)?);
            }
        }
        if max.is_empty() {
            match image_encoding {
                Some(img) => max.push(img.clone()),
                None => anyhow::bail!("prompt set needs a text prompt or an image encoding"),
            }
        }

        let mut min = Vec::new();
        for phrase in split_phrases(text_min) {
            min.push(embed_phrase(phrase)?);
        }

        Ok(Self { max, min })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn cosine_similarity_of_known_vectors() {
        let dev = Device::Cpu;
        let a = Tensor::new(&[[1.0f32, 0.0]], &dev).unwrap();
        let b = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0], [-1.0, 0.0]], &dev).unwrap();
        let cos = cosine_similarity(&a, &b).unwrap().to_vec1::<f32>().unwrap();
        assert!((cos[0] - 1.0).abs() < 1e-5);
        assert!(cos[1].abs() < 1e-5);
        assert!((cos[2] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn max_mode_rewards_similarity_and_min_mode_penalizes_it() {
        let dev = Device::Cpu;
        let text = Tensor::new(&[[1.0f32, 0.0]], &dev).unwrap();
        let imgs = Tensor::new(&[[2.0f32, 0.0]], &dev).unwrap();
        let max = view_scores(&text, &imgs, SimMode::Max, 100.0)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let min = view_scores(&text, &imgs, SimMode::Min, 100.0)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((max[0] + 100.0).abs() < 1e-3);
        assert!((min[0] - 100.0).abs() < 1e-3);
    }

    #[test]
    fn phrases_split_on_pipes_and_drop_blanks() {
        assert_eq!(
            split_phrases("a cat | a dog ||  "),
            vec!["a cat", "a dog"]
        );
        assert_eq!(split_phrases("single"), vec!["single"]);
    }
}
