//! Differentiable resizing primitives for the augmentation pipeline
//!
//! `resize_bilinear` is a manual bilinear sampler (align-corners-false pixel
//! centers) built from `index_select`, so gradients flow back to the source
//! image. `resample_lanczos` is the experimental path: a separable depthwise
//! Lanczos-3 low-pass before sampling, which noticeably reduces aliasing on
//! strong downscales. Borders are zero-padded rather than reflected.

use anyhow::Result;
use candle_core::Tensor;

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Normalized Lanczos-a taps, widened by the downscale ratio.
fn lanczos_taps(ratio: f64, a: usize) -> Vec<f32> {
    let scale = ratio.max(1.0);
    let support = (a as f64 * scale).ceil() as i64;
    let mut taps: Vec<f64> = (-support..=support)
        .map(|i| {
            let x = i as f64 / scale;
            sinc(x) * sinc(x / a as f64)
        })
        .collect();
    let sum: f64 = taps.iter().sum();
    for t in taps.iter_mut() {
        *t /= sum;
    }
    taps.into_iter().map(|t| t as f32).collect()
}

/// Per-axis sampling plan: low/high source indices and the blend fraction.
fn bilinear_axis(in_len: usize, out_len: usize) -> (Vec<u32>, Vec<u32>, Vec<f32>) {
    let mut lo = Vec::with_capacity(out_len);
    let mut hi = Vec::with_capacity(out_len);
    let mut frac = Vec::with_capacity(out_len);
    let scale = in_len as f64 / out_len as f64;
    for i in 0..out_len {
        let x = ((i as f64 + 0.5) * scale - 0.5).clamp(0.0, (in_len - 1) as f64);
        let l = x.floor() as usize;
        let h = (l + 1).min(in_len - 1);
        lo.push(l as u32);
        hi.push(h as u32);
        frac.push((x - l as f64) as f32);
    }
    (lo, hi, frac)
}

/// Bilinear resize of a (B, C, H, W) tensor, differentiable w.r.t. the input.
pub fn resize_bilinear(image: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (_b, _c, h, w) = image.dims4()?;
    let device = image.device();

    let blend = |t: &Tensor, dim: usize, in_len: usize, out_len: usize| -> Result<Tensor> {
        let (lo, hi, frac) = bilinear_axis(in_len, out_len);
        let lo = Tensor::from_vec(lo, out_len, device)?;
        let hi = Tensor::from_vec(hi, out_len, device)?;
        let shape = if dim == 2 {
            (1usize, 1usize, out_len, 1usize)
        } else {
            (1, 1, 1, out_len)
        };
        let frac = Tensor::from_vec(frac, shape, device)?;
        let t = t.contiguous()?;
        let near = t.index_select(&lo, dim)?;
        let far = t.index_select(&hi, dim)?;
        let out = (near.broadcast_mul(&frac.affine(-1.0, 1.0)?)? + far.broadcast_mul(&frac)?)?;
        Ok(out)
    };

    let rows = blend(image, 2, h, out_h)?;
    blend(&rows, 3, w, out_w)
}

/// Depthwise separable Lanczos-3 low-pass, then bilinear sampling to target.
pub fn resample_lanczos(image: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (_b, c, h, w) = image.dims4()?;
    let device = image.device();

    let filtered_h = {
        let ratio = h as f64 / out_h as f64;
        if ratio > 1.0 {
            let taps = lanczos_taps(ratio, 3);
            let k = taps.len();
            let mut data = Vec::with_capacity(c * k);
            for _ in 0..c {
                data.extend_from_slice(&taps);
            }
            let kernel = Tensor::from_vec(data, (c, 1, k, 1), device)?;
            image
                .pad_with_zeros(2, k / 2, k / 2)?
                .conv2d(&kernel, 0, 1, 1, c)?
        } else {
            image.clone()
        }
    };

    let filtered = {
        let ratio = w as f64 / out_w as f64;
        if ratio > 1.0 {
            let taps = lanczos_taps(ratio, 3);
            let k = taps.len();
            let mut data = Vec::with_capacity(c * k);
            for _ in 0..c {
                data.extend_from_slice(&taps);
            }
            let kernel = Tensor::from_vec(data, (c, 1, 1, k), device)?;
            filtered_h
                .pad_with_zeros(3, k / 2, k / 2)?
                .conv2d(&kernel, 0, 1, 1, c)?
        } else {
            filtered_h
        }
    };

    resize_bilinear(&filtered, out_h, out_w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn bilinear_produces_target_shape() {
        let img = Tensor::randn(0f32, 1f32, (1, 3, 50, 50), &Device::Cpu).unwrap();
        let out = resize_bilinear(&img, 224, 224).unwrap();
        assert_eq!(out.dims(), &[1, 3, 224, 224]);
    }

    #[test]
    fn bilinear_is_identity_at_same_size() {
        let img = Tensor::randn(0f32, 1f32, (1, 1, 7, 7), &Device::Cpu).unwrap();
        let out = resize_bilinear(&img, 7, 7).unwrap();
        let a = img.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn lanczos_produces_target_shape() {
        let img = Tensor::randn(0f32, 1f32, (2, 3, 96, 96), &Device::Cpu).unwrap();
        let out = resample_lanczos(&img, 32, 32).unwrap();
        assert_eq!(out.dims(), &[2, 3, 32, 32]);
    }

    #[test]
    fn lanczos_preserves_constant_images() {
        // the taps are normalized, so a flat image stays flat away from borders
        let img = Tensor::full(0.5f32, (1, 3, 64, 64), &Device::Cpu).unwrap();
        let out = resample_lanczos(&img, 16, 16).unwrap();
        let center = out
            .narrow(2, 4, 8)
            .unwrap()
            .narrow(3, 4, 8)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for v in center {
            assert!((v - 0.5).abs() < 1e-3, "center value {v}");
        }
    }
}
