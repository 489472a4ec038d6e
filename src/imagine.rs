//! Optimization driver
//!
//! Runs the epoch/iteration schedule: forward, averaged micro-batch loss,
//! one backward, an AdamW step on the latents, an EMA fold, and a periodic
//! eval-mode checkpoint. A shared cancel token is polled at every iteration
//! boundary so Ctrl-C lands between steps, never inside one, and the last
//! checkpoint on disk stays intact.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::clip::{Perceptor, PromptSet};
use crate::config::DreamConfig;
use crate::dream::DreamModel;
use crate::latents::{EmaLatents, Latents};
use crate::output::{select_best_view, OutputManager};

/// Cooperative cancellation flag, shared between the signal listener and the
/// optimization loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drive `f(epoch, iteration)` over the full schedule, checking the cancel
/// token before every call. Returns false when the schedule was cut short.
pub fn run_schedule<F>(
    epochs: usize,
    iterations: usize,
    cancel: &CancelToken,
    mut f: F,
) -> Result<bool>
where
    F: FnMut(usize, usize) -> Result<()>,
{
    for epoch in 0..epochs {
        for iteration in 0..iterations {
            if cancel.is_cancelled() {
                info!(epoch, iteration, "interrupted, stopping at the last checkpoint");
                return Ok(false);
            }
            f(epoch, iteration)?;
        }
    }
    Ok(true)
}

/// A checkpoint lands after every `save_every` completed iterations, so the
/// first one reflects `save_every` optimizer steps, not a single step.
fn checkpoint_due(iteration: usize, save_every: usize) -> bool {
    (iteration + 1) % save_every == 0
}

/// One full generation run: model, optimizer, prompt cache and output files.
pub struct Imagine {
    model: DreamModel,
    perceptor: Perceptor,
    optimizer: AdamW,
    prompts: PromptSet,
    image_encoding: Option<Tensor>,
    cfg: DreamConfig,
    output: OutputManager,
    cancel: CancelToken,
    device: Device,
}

impl Imagine {
    pub fn new(
        cfg: DreamConfig,
        model: DreamModel,
        perceptor: Perceptor,
        output: OutputManager,
        cancel: CancelToken,
        device: Device,
    ) -> Result<Self> {
        let image_encoding = match &cfg.img {
            Some(path) => Some(perceptor.embed_image_file(path)?),
            None => None,
        };
        let prompts = PromptSet::encode(
            &perceptor,
            cfg.text.as_deref(),
            &cfg.text_min,
            image_encoding.as_ref(),
        )?;
        let optimizer = AdamW::new(model.vars(), Self::adam_params(&cfg))?;
        Ok(Self {
            model,
            perceptor,
            optimizer,
            prompts,
            image_encoding,
            cfg,
            output,
            cancel,
            device,
        })
    }

    fn adam_params(cfg: &DreamConfig) -> ParamsAdamW {
        // plain Adam behaviour, no decoupled weight decay on the latents
        ParamsAdamW {
            lr: cfg.lr,
            weight_decay: 0.0,
            ..Default::default()
        }
    }

    /// Re-encode the prompt cache for a new text target mid-run. Output
    /// naming and best-score tracking start over with the new prompt.
    pub fn set_prompt(&mut self, text: Option<&str>, text_min: &str) -> Result<()> {
        self.cfg.text = text.map(str::to_string);
        self.cfg.text_min = text_min.to_string();
        self.prompts = PromptSet::encode(
            &self.perceptor,
            text,
            text_min,
            self.image_encoding.as_ref(),
        )?;
        self.output = OutputManager::new(
            self.cfg.output_dir.clone(),
            self.cfg.text.as_deref(),
            &self.cfg.text_min,
            self.cfg.img.as_deref(),
            self.cfg.seed,
            self.cfg.append_seed,
            self.cfg.save_progress,
            self.cfg.save_best,
            self.cfg.save_date_time,
        )?;
        Ok(())
    }

    /// Fresh latents and a fresh optimizer; the loaded models are reused.
    pub fn reset(&mut self) -> Result<()> {
        let gen_cfg = self.model.generator_config().clone();
        let latents = Latents::new(
            gen_cfg.num_latents(),
            gen_cfg.z_dim,
            gen_cfg.num_classes,
            self.cfg.max_classes,
            self.cfg.class_temperature,
            &self.device,
        )?;
        self.model
            .reset_latents(EmaLatents::new(latents, self.cfg.ema_decay)?);
        self.optimizer = AdamW::new(self.model.vars(), Self::adam_params(&self.cfg))?;
        Ok(())
    }

    /// One optimizer step. Micro-batch losses are averaged into a single
    /// scalar before the backward pass, which is equivalent to accumulating
    /// per-batch gradients and cheaper than multiple backwards.
    pub fn train_step(&mut self) -> Result<f64> {
        self.model.train();
        let k = self.cfg.gradient_accumulate_every;
        let mut total: Option<Tensor> = None;
        for _ in 0..k {
            let out = self.model.forward(&self.perceptor, &self.prompts)?;
            let loss = out.losses.total()?;
            total = Some(match total {
                Some(t) => (t + loss)?,
                None => loss,
            });
        }
        let loss = match total {
            Some(t) => (t / k as f64)?,
            None => bail!("gradient_accumulate_every must be non-zero"),
        };
        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;
        self.model.update_ema()?;
        Ok(loss.to_scalar::<f32>()? as f64)
    }

    /// Eval-mode render and save: the EMA latents produce the candidate, the
    /// best (lowest) per-view similarity score ranks it.
    pub fn checkpoint(&mut self, epoch: usize, iteration: usize) -> Result<()> {
        self.model.eval();
        let out = self.model.forward(&self.perceptor, &self.prompts)?;
        self.model.train();

        let scores = out.view_scores.detach().to_vec1::<f32>()?;
        let best = select_best_view(&scores)
            .map(|i| scores[i] as f64)
            .unwrap_or(0.0);
        let num = (epoch * self.cfg.iterations + iteration) / self.cfg.save_every;
        self.output
            .checkpoint(&out.image.detach(), best, Some(num));
        Ok(())
    }

    /// Run the whole schedule. Returns false when cancelled early.
    pub fn run(&mut self) -> Result<bool> {
        info!(
            prompt = self.cfg.text.as_deref().unwrap_or("<image encoding>"),
            size = self.model.image_size(),
            epochs = self.cfg.epochs,
            iterations = self.cfg.iterations,
            "imagining"
        );
        // warm-up pass; shape and device mismatches surface here instead of
        // minutes into the schedule
        self.model.train();
        let _ = self.model.forward(&self.perceptor, &self.prompts)?;

        let cancel = self.cancel.clone();
        let save_every = self.cfg.save_every;
        let completed = run_schedule(
            self.cfg.epochs,
            self.cfg.iterations,
            &cancel,
            |epoch, iteration| {
                let loss = self.train_step()?;
                debug!(epoch, iteration, loss, "step");
                if checkpoint_due(iteration, save_every) {
                    self.checkpoint(epoch, iteration)?;
                }
                Ok(())
            },
        )?;
        if completed {
            // final state, regardless of the save cadence
            self.checkpoint(self.cfg.epochs - 1, self.cfg.iterations - 1)?;
            info!(path = %self.output.canonical_path().display(), "done");
        }
        Ok(completed)
    }

    pub fn canonical_path(&self) -> std::path::PathBuf {
        self.output.canonical_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_visits_every_epoch_and_iteration() {
        let cancel = CancelToken::new();
        let mut seen = Vec::new();
        let completed = run_schedule(2, 3, &cancel, |e, i| {
            seen.push((e, i));
            Ok(())
        })
        .unwrap();
        assert!(completed);
        assert_eq!(
            seen,
            vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]
        );
    }

    #[test]
    fn cancellation_stops_the_schedule_between_iterations() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mut count = 0;
        let completed = run_schedule(10, 10, &cancel, |_, _| {
            count += 1;
            if count == 4 {
                trigger.cancel();
            }
            Ok(())
        })
        .unwrap();
        assert!(!completed);
        assert_eq!(count, 4);
    }

    #[test]
    fn checkpoints_land_after_full_save_intervals() {
        let due: Vec<usize> = (0..120).filter(|&i| checkpoint_due(i, 50)).collect();
        assert_eq!(due, vec![49, 99]);
        assert!(!checkpoint_due(0, 50));
    }

    #[test]
    fn schedule_propagates_step_errors() {
        let cancel = CancelToken::new();
        let result = run_schedule(1, 2, &cancel, |_, i| {
            if i == 1 {
                bail!("boom");
            }
            Ok(())
        });
        assert!(result.is_err());
    }
}
