//! Exponential moving average over trainable parameters
//!
//! The shadow values are detached tensors: gradients never reach them, they
//! are updated only by the linear recurrence after each optimizer step. At
//! construction the shadow equals the raw parameters, so evaluation output at
//! step 0 is unbiased.

use anyhow::{bail, Result};
use candle_core::{Tensor, Var};

/// Decayed running average of a set of `Var`s.
#[derive(Debug)]
pub struct Ema {
    decay: f64,
    shadow: Vec<Tensor>,
}

impl Ema {
    /// Start tracking `vars`. The initial shadow is a detached copy of each
    /// current value.
    pub fn new(vars: &[Var], decay: f64) -> Result<Self> {
        if decay <= 0.0 || decay >= 1.0 {
            bail!("EMA decay must lie in (0, 1), got {decay}");
        }
        let shadow = vars
            .iter()
            .map(|v| v.as_tensor().detach())
            .collect::<Vec<_>>();
        Ok(Self { decay, shadow })
    }

    /// Apply `shadow = decay * shadow + (1 - decay) * raw` for every tracked
    /// parameter. Call once per optimizer step, after the step.
    pub fn update(&mut self, vars: &[Var]) -> Result<()> {
        if vars.len() != self.shadow.len() {
            bail!(
                "EMA tracks {} parameters but was given {}",
                self.shadow.len(),
                vars.len()
            );
        }
        for (shadow, var) in self.shadow.iter_mut().zip(vars.iter()) {
            let raw = var.as_tensor().detach();
            *shadow = ((&*shadow * self.decay)? + (raw * (1.0 - self.decay))?)?.detach();
        }
        Ok(())
    }

    /// The shadow tensor at position `i` (same order as the `Var` slice given
    /// at construction).
    pub fn shadow(&self, i: usize) -> &Tensor {
        &self.shadow[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var_of(values: &[f32]) -> Var {
        let t = Tensor::new(values, &Device::Cpu).unwrap();
        Var::from_tensor(&t).unwrap()
    }

    #[test]
    fn shadow_equals_raw_at_construction() {
        let v = var_of(&[1.5, -2.0, 0.25]);
        let ema = Ema::new(&[v.clone()], 0.9).unwrap();
        let shadow = ema.shadow(0).to_vec1::<f32>().unwrap();
        assert_eq!(shadow, vec![1.5, -2.0, 0.25]);
    }

    #[test]
    fn two_updates_follow_the_linear_recurrence() {
        let d = 0.75f64;
        let r0 = 2.0f32;
        let r1 = -1.0f32;
        let r2 = 4.0f32;

        let v = var_of(&[r0]);
        let mut ema = Ema::new(&[v.clone()], d).unwrap();

        v.set(&Tensor::new(&[r1], &Device::Cpu).unwrap()).unwrap();
        ema.update(&[v.clone()]).unwrap();
        v.set(&Tensor::new(&[r2], &Device::Cpu).unwrap()).unwrap();
        ema.update(&[v.clone()]).unwrap();

        let expected =
            d as f32 * (d as f32 * r0 + (1.0 - d as f32) * r1) + (1.0 - d as f32) * r2;
        let got = ema.shadow(0).to_vec1::<f32>().unwrap()[0];
        assert!((got - expected).abs() < 1e-6, "got {got}, want {expected}");
    }

    #[test]
    fn rejects_decay_outside_the_open_unit_interval() {
        let v = var_of(&[0.0]);
        assert!(Ema::new(&[v.clone()], 1.0).is_err());
        assert!(Ema::new(&[v.clone()], 0.0).is_err());
        assert!(Ema::new(&[v], -0.1).is_err());
    }
}
