//! Trainable latent state for the generator
//!
//! The latents are the only trainable values in the whole system: one noise
//! vector per generator conditioning layer and a matching matrix of class
//! logits. The class logits are turned into the generator's class-conditioning
//! signal either densely (per-class sigmoid gates) or through a differentiable
//! top-k relaxation that commits to at most `max_classes` categories.

use anyhow::{bail, Result};
use candle_core::{Tensor, Var, D};
use tracing::debug;

use crate::ema::Ema;

/// Initialization for the class logits; keeps the initial sigmoid gates close
/// to zero so the generator starts from a near-uniform class mixture.
const CLASS_LOGIT_MEAN: f32 = -3.9;
const CLASS_LOGIT_STD: f32 = 0.3;

/// Iterative differentiable top-k.
///
/// Each pick takes a temperature softmax over the remaining logits, keeps its
/// arg-max entry, then masks that index out before the next pick. The k picks
/// are summed back into one row, so each row approximates a hard k-hot vector
/// (rows sum to k) while staying differentiable through the softmax values.
pub fn differentiable_topk(x: &Tensor, k: usize, temperature: f64) -> Result<Tensor> {
    if k == 0 {
        bail!("differentiable top-k needs k > 0");
    }
    let (n, dim) = x.dims2()?;
    let device = x.device();

    let mut working = x.clone();
    let mut acc: Option<Tensor> = None;
    for i in 0..k {
        let sm = candle_nn::ops::softmax(&(&working / temperature)?, D::Minus1)?;
        // Hard arg-max indices; the resulting mask is a constant with respect
        // to gradients, only the softmax values carry them.
        let idx = sm.argmax(D::Minus1)?.to_vec1::<u32>()?;
        let mut mask = vec![0f32; n * dim];
        for (row, &col) in idx.iter().enumerate() {
            mask[row * dim + col as usize] = 1.0;
        }
        let mask = Tensor::from_vec(mask, (n, dim), device)?;

        let values = sm.mul(&mask)?.sum_keepdim(D::Minus1)?;
        // Straight-through scaling: each pick is numerically a one-hot row
        // (so k picks sum to exactly k) while the gradient of the softmax
        // value still reaches the logits.
        let values = values.div(&values.detach())?;
        let pick = mask.broadcast_mul(&values)?;
        acc = Some(match acc {
            Some(a) => (a + pick)?,
            None => pick,
        });

        if i + 1 < k {
            working = (working + mask.affine(-1e9, 0.0)?)?;
        }
    }
    // acc is always Some here since k > 0
    Ok(acc.unwrap_or(x.zeros_like()?))
}

/// The raw trainable parameters: noise vectors and class logits.
#[derive(Debug)]
pub struct Latents {
    noise: Var,
    cls: Var,
    max_classes: Option<usize>,
    class_temperature: f64,
    num_latents: usize,
    z_dim: usize,
    num_classes: usize,
}

impl Latents {
    pub fn new(
        num_latents: usize,
        z_dim: usize,
        num_classes: usize,
        max_classes: Option<usize>,
        class_temperature: f64,
        device: &candle_core::Device,
    ) -> Result<Self> {
        if let Some(k) = max_classes {
            if k == 0 || k > num_classes {
                bail!("max_classes must be between 1 and {num_classes}, got {k}");
            }
        }
        let noise = Var::from_tensor(&Tensor::randn(0f32, 1f32, (num_latents, z_dim), device)?)?;
        let cls = Var::from_tensor(&Tensor::randn(
            CLASS_LOGIT_MEAN,
            CLASS_LOGIT_STD,
            (num_latents, num_classes),
            device,
        )?)?;
        debug!(num_latents, z_dim, num_classes, "initialized latents");
        Ok(Self {
            noise,
            cls,
            max_classes,
            class_temperature,
            num_latents,
            z_dim,
            num_classes,
        })
    }

    /// The trainable variables, in the order the EMA shadow mirrors them.
    pub fn vars(&self) -> Vec<Var> {
        vec![self.noise.clone(), self.cls.clone()]
    }

    /// Turn (noise, class logits) into the generator inputs.
    fn activate(&self, noise: &Tensor, cls: &Tensor) -> Result<(Tensor, Tensor)> {
        let classes = match self.max_classes {
            Some(k) => differentiable_topk(cls, k, self.class_temperature)?,
            None => candle_nn::ops::sigmoid(cls)?,
        };
        Ok((noise.clone(), classes))
    }

    pub fn num_latents(&self) -> usize {
        self.num_latents
    }

    pub fn z_dim(&self) -> usize {
        self.z_dim
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Which parameter set feeds the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Raw parameters: the optimization target.
    Train,
    /// EMA shadow parameters: smoother, used for checkpoints.
    Eval,
}

/// Latents together with their EMA shadow and a live mode switch.
///
/// The wrapper owns both the raw `Var`s and the shadow buffer; `forward`
/// substitutes whichever set the current mode selects. Gradients only ever
/// flow through the raw parameters.
#[derive(Debug)]
pub struct EmaLatents {
    latents: Latents,
    ema: Ema,
    mode: Mode,
}

impl EmaLatents {
    pub fn new(latents: Latents, ema_decay: f64) -> Result<Self> {
        let ema = Ema::new(&latents.vars(), ema_decay)?;
        Ok(Self {
            latents,
            ema,
            mode: Mode::Train,
        })
    }

    pub fn forward(&self) -> Result<(Tensor, Tensor)> {
        match self.mode {
            Mode::Train => self
                .latents
                .activate(self.latents.noise.as_tensor(), self.latents.cls.as_tensor()),
            Mode::Eval => self.latents.activate(self.ema.shadow(0), self.ema.shadow(1)),
        }
    }

    /// Fold the current raw values into the shadow. Call after each optimizer
    /// step.
    pub fn update(&mut self) -> Result<()> {
        self.ema.update(&self.latents.vars())
    }

    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn vars(&self) -> Vec<Var> {
        self.latents.vars()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn fresh_latents_have_expected_shapes() {
        let lat = Latents::new(15, 128, 1000, None, 2.0, &Device::Cpu).unwrap();
        let vars = lat.vars();
        assert_eq!(vars[0].dims(), &[15, 128]);
        assert_eq!(vars[1].dims(), &[15, 1000]);
    }

    #[test]
    fn ema_shadow_equals_raw_after_construction() {
        let lat = Latents::new(3, 8, 10, None, 2.0, &Device::Cpu).unwrap();
        let raw = lat.vars()[0].as_tensor().to_vec2::<f32>().unwrap();
        let wrapped = EmaLatents::new(lat, 0.99).unwrap();
        let (train_noise, _) = wrapped.forward().unwrap();
        assert_eq!(train_noise.to_vec2::<f32>().unwrap(), raw);
    }

    #[test]
    fn eval_mode_reads_the_shadow() {
        let lat = Latents::new(2, 4, 6, None, 2.0, &Device::Cpu).unwrap();
        let mut wrapped = EmaLatents::new(lat, 0.5).unwrap();
        wrapped.eval();
        assert_eq!(wrapped.mode(), Mode::Eval);
        // shadow equals raw at step 0, so eval and train forward agree
        let (eval_noise, _) = wrapped.forward().unwrap();
        wrapped.train();
        let (train_noise, _) = wrapped.forward().unwrap();
        assert_eq!(
            eval_noise.to_vec2::<f32>().unwrap(),
            train_noise.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn topk_rows_sum_to_k() {
        let x = Tensor::randn(0f32, 1f32, (4, 32), &Device::Cpu).unwrap();
        for k in [1usize, 3, 7] {
            let out = differentiable_topk(&x, k, 2.0).unwrap();
            assert_eq!(out.dims(), &[4, 32]);
            let sums = out.sum(D::Minus1).unwrap().to_vec1::<f32>().unwrap();
            for s in sums {
                assert!((s - k as f32).abs() < 1e-3, "row sum {s} for k = {k}");
            }
        }
    }

    #[test]
    fn max_classes_bounds_are_enforced() {
        assert!(Latents::new(3, 8, 10, Some(0), 2.0, &Device::Cpu).is_err());
        assert!(Latents::new(3, 8, 10, Some(11), 2.0, &Device::Cpu).is_err());
        assert!(Latents::new(3, 8, 10, Some(10), 2.0, &Device::Cpu).is_ok());
    }
}
