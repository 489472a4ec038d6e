//! Checkpoint file naming and persistence
//!
//! Output names are derived from the prompt so a directory of results stays
//! self-describing: spaces become underscores, pipes become "--", the
//! negative prompt is appended with a "_wout_" marker. One canonical file is
//! rewritten at every checkpoint; numbered progress files and a ".best" file
//! are optional. Save failures are logged and swallowed so a full disk never
//! kills a long run.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Tensor};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Upper bound on the generated file stem.
const MAX_STEM_LEN: usize = 255;

/// Build the output file stem from the run's inputs.
///
/// Hyphens fold into underscores before pipes expand to "--", so phrase
/// separators stay visible in the result.
pub fn sanitize_prompt(text: Option<&str>, text_min: &str, img: Option<&Path>) -> String {
    let mut name = String::new();
    if let Some(text) = text {
        name.push_str(text);
    }
    if let Some(img) = img {
        if let Some(stem) = img.file_stem().and_then(|s| s.to_str()) {
            if !name.is_empty() {
                name.push('_');
            }
            name.push_str(stem);
        }
    }
    if name.is_empty() {
        name.push_str("your_encoding");
    }
    if !text_min.is_empty() {
        name.push_str("_wout_");
        name.push_str(text_min);
    }
    let name = name
        .replace('-', "_")
        .replace(',', "")
        .replace(' ', "_")
        .replace('|', "--");
    let name: String = name.chars().take(MAX_STEM_LEN).collect();
    name.trim_matches(|c| c == '-' || c == '_').to_string()
}

/// Index of the lowest score, the best view under a lower-is-better scale.
pub fn select_best_view(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
}

/// Manages all image files of one run.
pub struct OutputManager {
    dir: PathBuf,
    stem: String,
    save_progress: bool,
    save_best: bool,
    save_date_time: bool,
    best_score: f64,
}

impl OutputManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dir: Option<PathBuf>,
        text: Option<&str>,
        text_min: &str,
        img: Option<&Path>,
        seed: Option<u64>,
        append_seed: bool,
        save_progress: bool,
        save_best: bool,
        save_date_time: bool,
    ) -> Result<Self> {
        let dir = dir.unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        let mut stem = sanitize_prompt(text, text_min, img);
        if append_seed {
            if let Some(seed) = seed {
                stem.push_str(&format!(".{seed}"));
            }
        }
        Ok(Self {
            dir,
            stem,
            save_progress,
            save_best,
            save_date_time,
            best_score: 0.0,
        })
    }

    fn path_for(&self, suffix: &str) -> PathBuf {
        let mut name = String::new();
        if self.save_date_time {
            name.push_str(&chrono::Local::now().format("%y%m%d-%H%M%S-").to_string());
        }
        name.push_str(&self.stem);
        name.push_str(suffix);
        name.push_str(".png");
        self.dir.join(name)
    }

    /// The canonical output path, rewritten at every checkpoint.
    pub fn canonical_path(&self) -> PathBuf {
        self.path_for("")
    }

    /// Record a checkpoint score; true when it strictly improves on the best
    /// seen so far. Scores are negative under the lower-is-better scale, so
    /// the initial best of 0.0 is beaten by any real checkpoint.
    pub fn record_score(&mut self, score: f64) -> bool {
        if score < self.best_score {
            self.best_score = score;
            true
        } else {
            false
        }
    }

    /// Persist one checkpoint image. Individual write failures are logged and
    /// skipped.
    pub fn checkpoint(&mut self, image: &Tensor, score: f64, progress_num: Option<usize>) {
        let canonical = self.canonical_path();
        self.try_save(image, &canonical);
        info!(path = %canonical.display(), score, "checkpoint saved");

        if self.save_progress {
            if let Some(num) = progress_num {
                let path = self.path_for(&format!(".{num}"));
                self.try_save(image, &path);
            }
        }

        if self.record_score(score) && self.save_best {
            let path = self.path_for(".best");
            self.try_save(image, &path);
        }
    }

    fn try_save(&self, image: &Tensor, path: &Path) {
        if let Err(e) = save_image(image, path) {
            warn!(path = %path.display(), error = %e, "failed to save checkpoint image");
        }
    }
}

/// Write a (1, 3, H, W) tensor in [0, 1] as a PNG.
pub fn save_image<P: AsRef<Path>>(image: &Tensor, path: P) -> Result<()> {
    let (_b, _c, h, w) = image.dims4()?;
    let data = image
        .squeeze(0)?
        .clamp(0f32, 1f32)?
        .permute((1, 2, 0))?
        .contiguous()?
        .affine(255.0, 0.0)?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let img = image::RgbImage::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| anyhow!("image buffer size mismatch for {h}x{w}"))?;
    img.save(path.as_ref())
        .with_context(|| format!("failed to write {}", path.as_ref().display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn prompt_names_fold_separators_and_negatives() {
        let name = sanitize_prompt(Some("a cat | a dog"), "blurry", None);
        assert_eq!(name, "a_cat_--_a_dog_wout_blurry");
    }

    #[test]
    fn image_only_prompts_use_the_file_stem() {
        let name = sanitize_prompt(None, "", Some(Path::new("refs/sunset photo.jpg")));
        assert_eq!(name, "sunset_photo");
    }

    #[test]
    fn encoding_only_runs_get_a_placeholder_name() {
        assert_eq!(sanitize_prompt(None, "", None), "your_encoding");
    }

    #[test]
    fn prompt_names_are_bounded() {
        let long = "word ".repeat(200);
        let name = sanitize_prompt(Some(&long), "", None);
        assert!(name.len() <= 255);
        assert!(!name.ends_with('_'));
    }

    #[test]
    fn best_view_is_the_arg_min() {
        assert_eq!(select_best_view(&[-3.2, -5.1, -1.0, -4.4]), Some(1));
        assert_eq!(select_best_view(&[]), None);
    }

    #[test]
    fn best_score_requires_strict_improvement() {
        let tmp = std::env::temp_dir().join("slumber-output-test");
        let mut out = OutputManager::new(
            Some(tmp),
            Some("test"),
            "",
            None,
            None,
            false,
            false,
            false,
            false,
        )
        .unwrap();
        assert!(out.record_score(-5.1));
        assert!(out.record_score(-5.8));
        assert!(!out.record_score(-4.0));
        assert!(!out.record_score(-5.8));
    }

    #[test]
    fn seed_suffix_lands_before_the_extension() {
        let tmp = std::env::temp_dir().join("slumber-output-test");
        let out = OutputManager::new(
            Some(tmp),
            Some("a fish"),
            "",
            None,
            Some(42),
            true,
            false,
            false,
            false,
        )
        .unwrap();
        let path = out.canonical_path();
        assert!(path.to_string_lossy().ends_with("a_fish.42.png"));
    }

    #[test]
    fn saved_images_round_trip_their_dimensions() {
        let tmp = std::env::temp_dir().join("slumber-output-test");
        std::fs::create_dir_all(&tmp).unwrap();
        let path = tmp.join("roundtrip.png");
        let img = Tensor::rand(0f32, 1f32, (1, 3, 8, 12), &Device::Cpu).unwrap();
        save_image(&img, &path).unwrap();
        let loaded = image::open(&path).unwrap();
        assert_eq!((loaded.width(), loaded.height()), (12, 8));
    }
}
