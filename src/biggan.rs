//! BigGAN-deep generator
//!
//! A candle port of the BigGAN-deep architecture the pretrained 128/256/512
//! checkpoints were published for: a shared class embedding concatenated with
//! a noise vector into a per-layer conditioning row, residual up-sampling
//! blocks with conditional batch norm, one self-attention block at the 64x64
//! stage, and a to-RGB head. Batch-norm statistics are stored at `n_stats`
//! truncation points and linearly interpolated at forward time.
//!
//! The generator is inference-only: weights are plain tensors, so gradients
//! flow through it into the conditioning inputs but never into it. Spectral
//! normalization is resolved once at load time from the stored u/v vectors.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder};
use std::path::Path;
use tracing::info;

const BN_EPS: f64 = 1e-4;

/// Static architecture description of one size variant.
#[derive(Debug, Clone)]
pub struct BigGanConfig {
    pub image_size: usize,
    /// Base channel multiplier.
    pub channel_width: usize,
    pub z_dim: usize,
    /// Shared class embedding width.
    pub embed_dim: usize,
    pub num_classes: usize,
    /// Number of truncation points the BN statistics were recorded at.
    pub n_stats: usize,
    /// Index in `layers` before which the self-attention block sits.
    pub attention_position: usize,
    /// (up_sample, in_channel_mult, out_channel_mult) per residual block.
    pub layers: Vec<(bool, usize, usize)>,
}

impl BigGanConfig {
    /// Configuration for one of the published size variants. Fails fast for
    /// any other size, before any weights are touched.
    pub fn for_size(image_size: usize) -> Result<Self> {
        let layers: Vec<(bool, usize, usize)> = match image_size {
            128 => vec![
                (false, 16, 16),
                (true, 16, 16),
                (false, 16, 16),
                (true, 16, 8),
                (false, 8, 8),
                (true, 8, 4),
                (false, 4, 4),
                (true, 4, 2),
                (false, 2, 2),
                (true, 2, 1),
            ],
            256 => vec![
                (false, 16, 16),
                (true, 16, 16),
                (false, 16, 16),
                (true, 16, 8),
                (false, 8, 8),
                (true, 8, 8),
                (false, 8, 8),
                (true, 8, 4),
                (false, 4, 4),
                (true, 4, 2),
                (false, 2, 2),
                (true, 2, 1),
            ],
            512 => vec![
                (false, 16, 16),
                (true, 16, 16),
                (false, 16, 16),
                (true, 16, 8),
                (false, 8, 8),
                (true, 8, 8),
                (false, 8, 8),
                (true, 8, 4),
                (false, 4, 4),
                (true, 4, 2),
                (false, 2, 2),
                (true, 2, 1),
                (false, 1, 1),
                (true, 1, 1),
            ],
            other => bail!("image size must be one of 128, 256 or 512, got {other}"),
        };
        Ok(Self {
            image_size,
            channel_width: 128,
            z_dim: 128,
            embed_dim: 128,
            num_classes: 1000,
            n_stats: 51,
            attention_position: 8,
            layers,
        })
    }

    /// One conditioning row per residual block plus the initial projection.
    pub fn num_latents(&self) -> usize {
        self.layers.len() + 1
    }

    /// Width of each conditioning row: noise concatenated with the class
    /// embedding.
    pub fn condition_dim(&self) -> usize {
        self.z_dim + self.embed_dim
    }
}

/// Resolve a possibly spectral-normalized weight to its effective value.
///
/// Checkpoints either store the plain `weight` or the triplet
/// `weight_orig`/`weight_u`/`weight_v`; sigma is `u^T W v`. When `weight_v`
/// is absent one power iteration recovers it from `u`.
fn spectral_weight(vb: &VarBuilder, dims: &[usize]) -> Result<Tensor> {
    if vb.contains_tensor("weight") {
        return Ok(vb.get(dims, "weight")?);
    }
    let w = vb.get(dims, "weight_orig")?;
    let out = dims[0];
    let rest: usize = dims[1..].iter().product();
    let w_mat = w.reshape((out, rest))?;
    let u = vb.get(out, "weight_u")?;
    let v = if vb.contains_tensor("weight_v") {
        vb.get(rest, "weight_v")?
    } else {
        let v = w_mat.t()?.matmul(&u.unsqueeze(1)?)?.squeeze(1)?;
        let norm = v.sqr()?.sum_all()?.sqrt()?;
        v.broadcast_div(&norm)?
    };
    let sigma = u
        .unsqueeze(0)?
        .matmul(&w_mat)?
        .matmul(&v.unsqueeze(1)?)?
        .flatten_all()?
        .to_vec1::<f32>()?[0];
    Ok((w / sigma as f64)?)
}

fn sn_linear(vb: VarBuilder, in_dim: usize, out_dim: usize, bias: bool) -> Result<Linear> {
    let w = spectral_weight(&vb, &[out_dim, in_dim])?;
    let b = if bias {
        Some(vb.get(out_dim, "bias")?)
    } else {
        None
    };
    Ok(Linear::new(w, b))
}

fn sn_conv2d(vb: VarBuilder, in_c: usize, out_c: usize, k: usize, padding: usize) -> Result<Conv2d> {
    let w = spectral_weight(&vb, &[out_c, in_c, k, k])?;
    let b = vb.get(out_c, "bias")?;
    let cfg = Conv2dConfig {
        padding,
        ..Default::default()
    };
    Ok(Conv2d::new(w, Some(b), cfg))
}

enum BatchNormKind {
    Conditional { scale: Linear, offset: Linear },
    Plain { weight: Tensor, bias: Tensor },
}

/// Batch norm with truncation-interpolated recorded statistics.
struct BigGanBatchNorm {
    running_means: Tensor,
    running_vars: Tensor,
    num_features: usize,
    n_stats: usize,
    kind: BatchNormKind,
}

impl BigGanBatchNorm {
    fn conditional(vb: VarBuilder, num_features: usize, cond_dim: usize, n_stats: usize) -> Result<Self> {
        let running_means = vb.get((n_stats, num_features), "running_means")?;
        let running_vars = vb.get((n_stats, num_features), "running_vars")?;
        let scale = sn_linear(vb.pp("scale"), cond_dim, num_features, false)?;
        let offset = sn_linear(vb.pp("offset"), cond_dim, num_features, false)?;
        Ok(Self {
            running_means,
            running_vars,
            num_features,
            n_stats,
            kind: BatchNormKind::Conditional { scale, offset },
        })
    }

    fn plain(vb: VarBuilder, num_features: usize, n_stats: usize) -> Result<Self> {
        let running_means = vb.get((n_stats, num_features), "running_means")?;
        let running_vars = vb.get((n_stats, num_features), "running_vars")?;
        let weight = vb.get(num_features, "weight")?;
        let bias = vb.get(num_features, "bias")?;
        Ok(Self {
            running_means,
            running_vars,
            num_features,
            n_stats,
            kind: BatchNormKind::Plain { weight, bias },
        })
    }

    fn stats(&self, truncation: f64) -> Result<(Tensor, Tensor)> {
        let idx = truncation.clamp(0.0, 1.0) * (self.n_stats - 1) as f64;
        let lo = idx.floor() as usize;
        let hi = (lo + 1).min(self.n_stats - 1);
        let frac = idx - lo as f64;
        let lerp = |t: &Tensor| -> Result<Tensor> {
            let a = t.narrow(0, lo, 1)?;
            let b = t.narrow(0, hi, 1)?;
            Ok(((a * (1.0 - frac))? + (b * frac)?)?)
        };
        Ok((lerp(&self.running_means)?, lerp(&self.running_vars)?))
    }

    fn forward(&self, x: &Tensor, cond: Option<&Tensor>, truncation: f64) -> Result<Tensor> {
        let c = self.num_features;
        let (mean, var) = self.stats(truncation)?;
        let mean = mean.reshape((1, c, 1, 1))?;
        let var = var.reshape((1, c, 1, 1))?;
        let x = x
            .broadcast_sub(&mean)?
            .broadcast_div(&(var + BN_EPS)?.sqrt()?)?;
        match (&self.kind, cond) {
            (BatchNormKind::Conditional { scale, offset }, Some(cond)) => {
                let gamma = (scale.forward(cond)? + 1.0)?.reshape((1, c, 1, 1))?;
                let beta = offset.forward(cond)?.reshape((1, c, 1, 1))?;
                Ok(x.broadcast_mul(&gamma)?.broadcast_add(&beta)?)
            }
            (BatchNormKind::Plain { weight, bias }, _) => {
                let gamma = weight.reshape((1, c, 1, 1))?;
                let beta = bias.reshape((1, c, 1, 1))?;
                Ok(x.broadcast_mul(&gamma)?.broadcast_add(&beta)?)
            }
            (BatchNormKind::Conditional { .. }, None) => {
                bail!("conditional batch norm requires a conditioning vector")
            }
        }
    }
}

/// Residual block: four conditional-BN/ReLU/conv stages around a bottleneck,
/// with optional 2x nearest up-sampling and channel dropping on the skip.
struct GenBlock {
    bn_0: BigGanBatchNorm,
    bn_1: BigGanBatchNorm,
    bn_2: BigGanBatchNorm,
    bn_3: BigGanBatchNorm,
    conv_0: Conv2d,
    conv_1: Conv2d,
    conv_2: Conv2d,
    conv_3: Conv2d,
    up_sample: bool,
    drop_channels: bool,
    out_channels: usize,
}

impl GenBlock {
    fn new(
        vb: VarBuilder,
        in_c: usize,
        out_c: usize,
        cond_dim: usize,
        n_stats: usize,
        up_sample: bool,
    ) -> Result<Self> {
        let mid = in_c / 4;
        Ok(Self {
            bn_0: BigGanBatchNorm::conditional(vb.pp("bn_0"), in_c, cond_dim, n_stats)?,
            bn_1: BigGanBatchNorm::conditional(vb.pp("bn_1"), mid, cond_dim, n_stats)?,
            bn_2: BigGanBatchNorm::conditional(vb.pp("bn_2"), mid, cond_dim, n_stats)?,
            bn_3: BigGanBatchNorm::conditional(vb.pp("bn_3"), mid, cond_dim, n_stats)?,
            conv_0: sn_conv2d(vb.pp("conv_0"), in_c, mid, 1, 0)?,
            conv_1: sn_conv2d(vb.pp("conv_1"), mid, mid, 3, 1)?,
            conv_2: sn_conv2d(vb.pp("conv_2"), mid, mid, 3, 1)?,
            conv_3: sn_conv2d(vb.pp("conv_3"), mid, out_c, 1, 0)?,
            up_sample,
            drop_channels: in_c != out_c,
            out_channels: out_c,
        })
    }

    fn forward(&self, x: &Tensor, cond: &Tensor, truncation: f64) -> Result<Tensor> {
        let mut h = self.bn_0.forward(x, Some(cond), truncation)?.relu()?;
        h = self.conv_0.forward(&h)?;

        h = self.bn_1.forward(&h, Some(cond), truncation)?.relu()?;
        if self.up_sample {
            h = h.upsample_nearest2d(h.dim(2)? * 2, h.dim(3)? * 2)?;
        }
        h = self.conv_1.forward(&h)?;

        h = self.bn_2.forward(&h, Some(cond), truncation)?.relu()?;
        h = self.conv_2.forward(&h)?;

        h = self.bn_3.forward(&h, Some(cond), truncation)?.relu()?;
        h = self.conv_3.forward(&h)?;

        let mut skip = if self.drop_channels {
            x.narrow(1, 0, self.out_channels)?
        } else {
            x.clone()
        };
        if self.up_sample {
            skip = skip.upsample_nearest2d(skip.dim(2)? * 2, skip.dim(3)? * 2)?;
        }
        Ok((h + skip)?)
    }
}

/// Non-local block at the 64x64 stage.
struct SelfAttn {
    theta: Conv2d,
    phi: Conv2d,
    g: Conv2d,
    o_conv: Conv2d,
    gamma: Tensor,
}

impl SelfAttn {
    fn new(vb: VarBuilder, ch: usize) -> Result<Self> {
        Ok(Self {
            theta: sn_conv2d(vb.pp("snconv1x1_theta"), ch, ch / 8, 1, 0)?,
            phi: sn_conv2d(vb.pp("snconv1x1_phi"), ch, ch / 8, 1, 0)?,
            g: sn_conv2d(vb.pp("snconv1x1_g"), ch, ch / 2, 1, 0)?,
            o_conv: sn_conv2d(vb.pp("snconv1x1_o_conv"), ch / 2, ch, 1, 0)?,
            gamma: vb.get(1, "gamma")?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, ch, h, w) = x.dims4()?;
        let hw = h * w;
        let theta = self.theta.forward(x)?.reshape((b, ch / 8, hw))?;
        let phi = self
            .phi
            .forward(x)?
            .max_pool2d(2)?
            .reshape((b, ch / 8, hw / 4))?;
        let attn = candle_nn::ops::softmax(&theta.transpose(1, 2)?.matmul(&phi)?, D::Minus1)?;
        let g = self
            .g
            .forward(x)?
            .max_pool2d(2)?
            .reshape((b, ch / 2, hw / 4))?;
        let attn_g = g
            .matmul(&attn.transpose(1, 2)?)?
            .reshape((b, ch / 2, h, w))?;
        let o = self.o_conv.forward(&attn_g)?;
        Ok((x + o.broadcast_mul(&self.gamma)?)?)
    }
}

enum GenLayer {
    Block(GenBlock),
    Attn(SelfAttn),
}

/// The full generator: class embedding, initial projection, residual stack,
/// final norm and to-RGB head.
pub struct BigGan {
    embeddings: Linear,
    gen_z: Linear,
    layers: Vec<GenLayer>,
    final_bn: BigGanBatchNorm,
    conv_to_rgb: Conv2d,
    config: BigGanConfig,
}

impl BigGan {
    pub fn new(config: BigGanConfig, vb: VarBuilder) -> Result<Self> {
        let ch = config.channel_width;
        let cond_dim = config.condition_dim();

        let embeddings = Linear::new(
            vb.get((config.embed_dim, config.num_classes), "embeddings.weight")?,
            None,
        );
        let g = vb.pp("generator");
        let gen_z = sn_linear(g.pp("gen_z"), cond_dim, 4 * 4 * 16 * ch, true)?;

        let mut layers = Vec::new();
        let mut module_idx = 0usize;
        for (i, &(up, in_mult, out_mult)) in config.layers.iter().enumerate() {
            if i == config.attention_position {
                layers.push(GenLayer::Attn(SelfAttn::new(
                    g.pp(format!("layers.{module_idx}")),
                    ch * in_mult,
                )?));
                module_idx += 1;
            }
            layers.push(GenLayer::Block(GenBlock::new(
                g.pp(format!("layers.{module_idx}")),
                ch * in_mult,
                ch * out_mult,
                cond_dim,
                config.n_stats,
                up,
            )?));
            module_idx += 1;
        }

        let final_bn = BigGanBatchNorm::plain(g.pp("bn"), ch, config.n_stats)?;
        let conv_to_rgb = sn_conv2d(g.pp("conv_to_rgb"), ch, ch, 3, 1)?;

        Ok(Self {
            embeddings,
            gen_z,
            layers,
            final_bn,
            conv_to_rgb,
            config,
        })
    }

    /// Load a pretrained checkpoint (PyTorch pickle format).
    pub fn from_pth<P: AsRef<Path>>(
        path: P,
        config: BigGanConfig,
        device: &Device,
    ) -> Result<Self> {
        info!(
            path = %path.as_ref().display(),
            image_size = config.image_size,
            "Loading BigGAN-deep generator"
        );
        let vb = VarBuilder::from_pth(path.as_ref(), DType::F32, device)
            .context("failed to read BigGAN checkpoint")?;
        let model = Self::new(config, vb)?;
        info!("✓ BigGAN generator loaded");
        Ok(model)
    }

    pub fn config(&self) -> &BigGanConfig {
        &self.config
    }

    /// Generate one image from per-layer conditioning.
    ///
    /// `noise` is (num_latents, z_dim), `classes` is (num_latents,
    /// num_classes); row 0 feeds the initial projection and each following
    /// row one residual block. Output is (1, 3, S, S) in [-1, 1].
    pub fn forward(&self, noise: &Tensor, classes: &Tensor, truncation: f64) -> Result<Tensor> {
        let (n, _z) = noise.dims2()?;
        if n != self.config.num_latents() {
            bail!(
                "generator expects {} conditioning rows, got {n}",
                self.config.num_latents()
            );
        }
        let ch = self.config.channel_width;

        let embed = self.embeddings.forward(classes)?;
        let cond = Tensor::cat(&[noise, &embed], 1)?;

        let mut z = self.gen_z.forward(&cond.narrow(0, 0, 1)?)?;
        z = z
            .reshape((1, 4, 4, 16 * ch))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;

        let mut cond_idx = 1usize;
        for layer in &self.layers {
            match layer {
                GenLayer::Block(block) => {
                    z = block.forward(&z, &cond.narrow(0, cond_idx, 1)?, truncation)?;
                    cond_idx += 1;
                }
                GenLayer::Attn(attn) => {
                    z = attn.forward(&z)?;
                }
            }
        }

        z = self.final_bn.forward(&z, None, truncation)?.relu()?;
        z = self.conv_to_rgb.forward(&z)?.narrow(1, 0, 3)?;
        Ok(z.tanh()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_unsupported_sizes_before_any_weights() {
        for size in [64, 384, 1024, 0] {
            let err = BigGanConfig::for_size(size).unwrap_err();
            assert!(err.to_string().contains("image size"), "size {size}");
        }
    }

    #[test]
    fn latent_counts_match_published_variants() {
        assert_eq!(BigGanConfig::for_size(128).unwrap().num_latents(), 11);
        assert_eq!(BigGanConfig::for_size(256).unwrap().num_latents(), 13);
        assert_eq!(BigGanConfig::for_size(512).unwrap().num_latents(), 15);
    }

    #[test]
    fn conditioning_row_width_is_noise_plus_embedding() {
        let cfg = BigGanConfig::for_size(128).unwrap();
        assert_eq!(cfg.condition_dim(), 256);
    }

    #[test]
    fn upsampling_steps_reach_the_target_resolution() {
        for size in [128usize, 256, 512] {
            let cfg = BigGanConfig::for_size(size).unwrap();
            let ups = cfg.layers.iter().filter(|(up, _, _)| *up).count();
            assert_eq!(4 << ups, size, "size {size}");
        }
    }
}
