//! Candidate image model
//!
//! One forward pass: activate the latents, run the generator, map the output
//! to [0, 1], cut it into augmented views, embed the views and score them
//! against the cached prompt embeddings. Everything from the latents to the
//! per-view scores stays on one differentiable graph; the regularizers are
//! computed on the same activation pass so one backward covers all terms.

use anyhow::Result;
use candle_core::{Tensor, Var, D};

use crate::biggan::BigGan;
use crate::clip::{view_scores, Perceptor, PromptSet, SimMode};
use crate::cutouts::CutoutPipeline;
use crate::latents::EmaLatents;
use crate::loss::{class_reg, latent_reg, LossTerms};

/// Truncation used for every forward pass. 1.0 selects the last recorded
/// batch-norm statistics, trading sample fidelity for diversity.
const TRUNCATION: f64 = 1.0;

/// Per-view scores summed over every phrase, max and min alike. Each extra
/// phrase adds its full term, so multi-phrase prompts carry proportionally
/// more similarity pressure against the fixed regularizers.
pub fn phrase_scores(prompts: &PromptSet, image_embeds: &Tensor, coef: f64) -> Result<Tensor> {
    let mut per_view: Option<Tensor> = None;
    let mut add = |scores: Tensor| -> Result<()> {
        per_view = Some(match per_view.take() {
            Some(acc) => (acc + scores)?,
            None => scores,
        });
        Ok(())
    };
    for embed in &prompts.max {
        add(view_scores(embed, image_embeds, SimMode::Max, coef)?)?;
    }
    for embed in &prompts.min {
        add(view_scores(embed, image_embeds, SimMode::Min, coef)?)?;
    }
    match per_view {
        Some(v) => Ok(v),
        None => anyhow::bail!("scored a forward pass against an empty prompt set"),
    }
}

/// Result of one scored forward pass.
pub struct DreamOutput {
    /// Full-resolution candidate, (1, 3, S, S) in [0, 1].
    pub image: Tensor,
    /// Per-view similarity scores, (num_cutouts,). Lower is better.
    pub view_scores: Tensor,
    pub losses: LossTerms,
}

/// Generator, trainable latents and augmentation pipeline wired together.
pub struct DreamModel {
    generator: BigGan,
    latents: EmaLatents,
    cutouts: CutoutPipeline,
    loss_coef: f64,
}

impl DreamModel {
    pub fn new(
        generator: BigGan,
        latents: EmaLatents,
        cutouts: CutoutPipeline,
        loss_coef: f64,
    ) -> Self {
        Self {
            generator,
            latents,
            cutouts,
            loss_coef,
        }
    }

    /// Full scored pass against the prompt set.
    pub fn forward(&mut self, perceptor: &Perceptor, prompts: &PromptSet) -> Result<DreamOutput> {
        let (noise, classes) = self.latents.forward()?;
        let raw = self.generator.forward(&noise, &classes, TRUNCATION)?;
        let image = raw.affine(0.5, 0.5)?;

        let views = self.cutouts.views(&image)?;
        let embeds = perceptor.embed_views(&views)?;
        let per_view = phrase_scores(prompts, &embeds, self.loss_coef)?;

        let losses = LossTerms {
            lat: latent_reg(&noise)?,
            cls: class_reg(&classes)?,
            sim: per_view.mean(D::Minus1)?,
        };

        Ok(DreamOutput {
            image,
            view_scores: per_view,
            losses,
        })
    }

    /// Switch the latent forward to the raw trainable parameters.
    pub fn train(&mut self) {
        self.latents.train();
    }

    /// Switch the latent forward to the EMA shadow.
    pub fn eval(&mut self) {
        self.latents.eval();
    }

    /// Fold the raw parameters into the EMA shadow after an optimizer step.
    pub fn update_ema(&mut self) -> Result<()> {
        self.latents.update()
    }

    pub fn vars(&self) -> Vec<Var> {
        self.latents.vars()
    }

    /// Swap in freshly initialized latents, restarting the optimization.
    pub fn reset_latents(&mut self, latents: EmaLatents) {
        self.latents = latents;
    }

    pub fn generator_config(&self) -> &crate::biggan::BigGanConfig {
        self.generator.config()
    }

    pub fn image_size(&self) -> usize {
        self.generator.config().image_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn embed(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
    }

    #[test]
    fn two_phrases_score_as_the_sum_of_their_single_phrase_terms() {
        let dev = Device::Cpu;
        let imgs = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0], [0.6, 0.8]], &dev).unwrap();
        let e1 = embed(&[1.0, 0.0]);
        let e2 = embed(&[0.0, 1.0]);

        let s1 = phrase_scores(
            &PromptSet {
                max: vec![e1.clone()],
                min: vec![],
            },
            &imgs,
            100.0,
        )
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
        let s2 = phrase_scores(
            &PromptSet {
                max: vec![e2.clone()],
                min: vec![],
            },
            &imgs,
            100.0,
        )
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
        let both = phrase_scores(
            &PromptSet {
                max: vec![e1, e2],
                min: vec![],
            },
            &imgs,
            100.0,
        )
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();

        for ((a, b), sum) in s1.iter().zip(s2.iter()).zip(both.iter()) {
            assert!((a + b - sum).abs() < 1e-4, "{a} + {b} != {sum}");
        }
    }

    #[test]
    fn min_phrases_add_their_term_on_top_of_max_phrases() {
        let dev = Device::Cpu;
        let imgs = Tensor::new(&[[1.0f32, 0.0]], &dev).unwrap();
        let target = embed(&[1.0, 0.0]);
        let avoid = embed(&[1.0, 0.0]);

        // cos = 1 for both: max contributes -100, min contributes +100
        let scores = phrase_scores(
            &PromptSet {
                max: vec![target],
                min: vec![avoid],
            },
            &imgs,
            100.0,
        )
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
        assert!(scores[0].abs() < 1e-3, "expected -100 + 100, got {}", scores[0]);
    }

    #[test]
    fn empty_prompt_sets_are_rejected() {
        let imgs = Tensor::new(&[[1.0f32, 0.0]], &Device::Cpu).unwrap();
        let empty = PromptSet {
            max: vec![],
            min: vec![],
        };
        assert!(phrase_scores(&empty, &imgs, 100.0).is_err());
    }
}
