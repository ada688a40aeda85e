use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app::calculate::project_assignments;

/// A source image plus the permutation that rearranges it into the target.
#[derive(Clone, Serialize, Deserialize)]
pub struct Preset {
    pub inner: UnprocessedPreset,
    pub assignments: Vec<usize>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UnprocessedPreset {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub source_img: Vec<u8>,
}

/// Probed when `presets/index.json` is absent.
pub const DEFAULT_PRESET_NAMES: [&str; 5] = ["wisetree", "blackhole", "cat", "cat2", "colorful"];

impl Preset {
    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        let w = self.inner.width;
        let h = self.inner.height;
        if w != h {
            return Err(format!("preset image must be square, got {w}x{h}").into());
        }
        let n = (w * h) as usize;
        if self.inner.source_img.len() != n * 3 {
            return Err(format!(
                "source buffer holds {} bytes, expected {}",
                self.inner.source_img.len(),
                n * 3
            )
            .into());
        }
        if self.assignments.len() != n {
            return Err(format!(
                "assignments holds {} entries, expected {n}",
                self.assignments.len()
            )
            .into());
        }
        if let Some(&bad) = self.assignments.iter().find(|&&s| s >= n) {
            return Err(format!("assignment index {bad} out of range 0..{n}").into());
        }
        Ok(())
    }

    /// The rearranged image this preset renders to once the morph settles.
    pub fn output_image(&self) -> RgbImage {
        let pixels: Vec<(u8, u8, u8)> = self
            .inner
            .source_img
            .chunks_exact(3)
            .map(|c| (c[0], c[1], c[2]))
            .collect();
        let data = project_assignments(&pixels, &self.assignments, self.inner.width);
        RgbImage::from_vec(self.inner.width, self.inner.height, data)
            .expect("projection preserves dimensions")
    }

    /// Load `<dir>/source.png` and `<dir>/assignments.json`. Grayscale and
    /// RGBA sources are promoted/stripped to RGB by the decoder.
    pub fn load_from_dir(dir: &Path) -> Result<Preset, Box<dyn Error>> {
        let name = dir
            .file_name()
            .ok_or("preset path has no directory name")?
            .to_string_lossy()
            .into_owned();
        let img = image::open(dir.join("source.png"))?.to_rgb8();
        let assignments: Vec<usize> =
            serde_json::from_str(&fs::read_to_string(dir.join("assignments.json"))?)?;

        let preset = Preset {
            inner: UnprocessedPreset {
                name,
                width: img.width(),
                height: img.height(),
                source_img: img.into_raw(),
            },
            assignments,
        };
        preset.validate()?;
        Ok(preset)
    }

    /// Write the preset under `presets_root`, allocating `name`, `name_1`,
    /// ... so existing results are never clobbered. Returns the directory.
    pub fn save_under(&self, presets_root: &Path) -> Result<PathBuf, Box<dyn Error>> {
        let mut dir_name = self.inner.name.clone();
        let mut counter = 1;
        while presets_root.join(&dir_name).exists() {
            dir_name = format!("{}_{}", self.inner.name, counter);
            counter += 1;
        }
        let dir = presets_root.join(dir_name);
        fs::create_dir_all(&dir)?;

        let source = RgbImage::from_vec(
            self.inner.width,
            self.inner.height,
            self.inner.source_img.clone(),
        )
        .ok_or("source buffer does not match its dimensions")?;
        source.save(dir.join("source.png"))?;
        self.output_image().save(dir.join("output.png"))?;
        fs::write(
            dir.join("assignments.json"),
            serde_json::to_string(&self.assignments)?,
        )?;
        info!("saved preset to {}", dir.display());
        Ok(dir)
    }
}

/// Load every preset listed in `<root>/index.json`, or probe the default
/// names when no index exists. Unreadable entries are skipped with a
/// warning so one broken directory does not take the library down.
pub fn load_library(root: &Path) -> Vec<Preset> {
    let names: Vec<String> = match fs::read_to_string(root.join("index.json")) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(names) => names,
            Err(err) => {
                warn!("malformed preset index: {err}");
                return Vec::new();
            }
        },
        Err(_) => DEFAULT_PRESET_NAMES.iter().map(|s| s.to_string()).collect(),
    };

    let mut presets = Vec::new();
    for name in names {
        match Preset::load_from_dir(&root.join(&name)) {
            Ok(preset) => presets.push(preset),
            Err(err) => warn!("skipping preset {name}: {err}"),
        }
    }
    presets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n_side: u32) -> Preset {
        let n = (n_side * n_side) as usize;
        Preset {
            inner: UnprocessedPreset {
                name: "sample".to_string(),
                width: n_side,
                height: n_side,
                source_img: (0..n * 3).map(|i| (i % 251) as u8).collect(),
            },
            assignments: (0..n).rev().collect(),
        }
    }

    #[test]
    fn valid_preset_passes() {
        assert!(sample(4).validate().is_ok());
    }

    #[test]
    fn validation_catches_shape_errors() {
        let mut p = sample(4);
        p.inner.height = 5;
        assert!(p.validate().is_err());

        let mut p = sample(4);
        p.assignments.pop();
        assert!(p.validate().is_err());

        let mut p = sample(4);
        p.assignments[0] = 16;
        assert!(p.validate().is_err());

        let mut p = sample(4);
        p.inner.source_img.pop();
        assert!(p.validate().is_err());
    }

    #[test]
    fn output_image_projects_the_permutation() {
        let p = sample(2);
        let out = p.output_image();
        // target 0 receives source 3
        let src = &p.inner.source_img;
        assert_eq!(out.get_pixel(0, 0).0, [src[9], src[10], src[11]]);
    }
}
