use std::error::Error;

use image::{GrayImage, RgbImage, imageops};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::preset::UnprocessedPreset;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Genetic,
    Optimal,
    Auction,
    Hybrid,
}

/// Crop window before resampling: `scale >= 1` zooms into the image,
/// `x`/`y` in [-1, 1] pan the window inside the leftover margin.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CropScale {
    pub scale: f32,
    pub x: f32,
    pub y: f32,
}

impl Default for CropScale {
    fn default() -> Self {
        Self {
            scale: 1.0,
            x: 0.0,
            y: 0.0,
        }
    }
}

/// Optional replacement target. Without one, the cropped source is its own
/// target. `weights` is one byte per pixel, same dimensions as `image`;
/// absent means a uniform 255.
#[derive(Clone, Serialize, Deserialize)]
pub struct CustomTarget {
    pub image: UnprocessedPreset,
    pub weights: Option<Vec<u8>>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub id: Uuid,
    pub name: String,
    pub proximity_importance: i64,
    pub algorithm: Algorithm,
    pub sidelen: u32,
    pub custom_target: Option<CustomTarget>,
    pub source_crop: CropScale,
    pub target_crop: CropScale,
}

impl GenerationSettings {
    pub fn default(id: Uuid, name: String) -> Self {
        Self {
            id,
            name,
            proximity_importance: 13,
            algorithm: Algorithm::Genetic,
            sidelen: 64,
            custom_target: None,
            source_crop: CropScale::default(),
            target_crop: CropScale::default(),
        }
    }

    /// UI-level range checks. The solver cores accept any square input so
    /// small fixtures stay testable; sessions started through the
    /// orchestrator go through this first.
    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.sidelen < 64 || self.sidelen > 2048 || self.sidelen % 64 != 0 {
            return Err(format!("sidelen {} not in 64..=2048 (step 64)", self.sidelen).into());
        }
        if !(1..=50).contains(&self.proximity_importance) {
            return Err(format!(
                "proximity importance {} not in 1..=50",
                self.proximity_importance
            )
            .into());
        }
        if self.source_crop.scale < 1.0 || self.target_crop.scale < 1.0 {
            return Err("crop scale must be >= 1".into());
        }
        Ok(())
    }
}

/// Sum-shift hash of the settings id, used to seed every solver PRNG so a
/// run is reproducible from its id alone.
pub fn seed_from_id(id: &str) -> u64 {
    let mut h: u64 = 0;
    for b in id.bytes() {
        h = h.wrapping_add(b as u64);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}

fn crop_window(w: u32, h: u32, crop: CropScale) -> (u32, u32, u32) {
    let base = w.min(h);
    let side = (base as f64 / crop.scale.max(1.0) as f64)
        .clamp(1.0, base as f64)
        .floor() as u32;
    let max_off_x = w - side;
    let max_off_y = h - side;
    let xn = crop.x.clamp(-1.0, 1.0) as f64 * 0.5 + 0.5;
    let yn = crop.y.clamp(-1.0, 1.0) as f64 * 0.5 + 0.5;
    let x0 = (xn * max_off_x as f64).floor() as u32;
    let y0 = (yn * max_off_y as f64).floor() as u32;
    (x0, y0, side)
}

/// Cut the largest square the crop parameters allow, then resample to
/// `sidelen`. Resampling is skipped when the window already matches.
pub fn crop_scale(img: &RgbImage, sidelen: u32, crop: CropScale) -> RgbImage {
    let (w, h) = img.dimensions();
    let (x0, y0, side) = crop_window(w, h, crop);
    let window = imageops::crop_imm(img, x0, y0, side, side).to_image();
    if side == sidelen {
        return window;
    }
    imageops::resize(&window, sidelen, sidelen, imageops::FilterType::Lanczos3)
}

fn crop_scale_weights(img: &GrayImage, sidelen: u32, crop: CropScale) -> GrayImage {
    let (w, h) = img.dimensions();
    let (x0, y0, side) = crop_window(w, h, crop);
    let window = imageops::crop_imm(img, x0, y0, side, side).to_image();
    if side == sidelen {
        return window;
    }
    imageops::resize(&window, sidelen, sidelen, imageops::FilterType::Lanczos3)
}

type Extracted = (Vec<(u8, u8, u8)>, Vec<(u8, u8, u8)>, Vec<f64>);

/// Decode, crop and scale the session inputs into the `sidelen` frame:
/// source palette, target palette and per-target color weights.
pub(crate) fn get_images(
    source: RgbImage,
    settings: &GenerationSettings,
) -> Result<Extracted, Box<dyn Error>> {
    let n = (settings.sidelen * settings.sidelen) as usize;
    let source_sq = crop_scale(&source, settings.sidelen, settings.source_crop);
    let source_pixels = source_sq
        .pixels()
        .map(|p| (p[0], p[1], p[2]))
        .collect::<Vec<_>>();

    let (target_pixels, weights) = match &settings.custom_target {
        Some(custom) => {
            let img = RgbImage::from_vec(
                custom.image.width,
                custom.image.height,
                custom.image.source_img.clone(),
            )
            .ok_or("target buffer does not match its dimensions")?;
            let target_sq = crop_scale(&img, settings.sidelen, settings.target_crop);
            let weights = match &custom.weights {
                Some(buf) => {
                    let gray =
                        GrayImage::from_vec(custom.image.width, custom.image.height, buf.clone())
                            .ok_or("weight buffer does not match target dimensions")?;
                    crop_scale_weights(&gray, settings.sidelen, settings.target_crop)
                        .pixels()
                        .map(|p| p[0] as f64)
                        .collect()
                }
                None => vec![255.0; n],
            };
            let pixels = target_sq.pixels().map(|p| (p[0], p[1], p[2])).collect();
            (pixels, weights)
        }
        None => (source_pixels.clone(), vec![255.0; n]),
    };

    Ok((source_pixels, target_pixels, weights))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(side: u32) -> RgbImage {
        RgbImage::from_fn(side, side, |x, y| Rgb([(x * 3) as u8, (y * 3) as u8, 128]))
    }

    #[test]
    fn unit_crop_of_square_is_identity() {
        let img = gradient(64);
        let out = crop_scale(&img, 64, CropScale::default());
        assert_eq!(img, out);
    }

    #[test]
    fn crop_window_pans_inside_margin() {
        // 200x100 with scale 2: window side = 50, x margin = 150, y margin = 50
        let (x0, y0, side) = crop_window(
            200,
            100,
            CropScale {
                scale: 2.0,
                x: 1.0,
                y: -1.0,
            },
        );
        assert_eq!(side, 50);
        assert_eq!(x0, 150);
        assert_eq!(y0, 0);

        let (x0, y0, _) = crop_window(
            200,
            100,
            CropScale {
                scale: 2.0,
                x: 0.0,
                y: 0.0,
            },
        );
        assert_eq!(x0, 75);
        assert_eq!(y0, 25);
    }

    #[test]
    fn crop_clamps_out_of_range_pan() {
        let a = crop_window(
            100,
            100,
            CropScale {
                scale: 4.0,
                x: 5.0,
                y: 5.0,
            },
        );
        let b = crop_window(
            100,
            100,
            CropScale {
                scale: 4.0,
                x: 1.0,
                y: 1.0,
            },
        );
        assert_eq!(a, b);
    }

    #[test]
    fn resample_preserves_flat_colors_within_tolerance() {
        // Non-square input forces the crop + Lanczos resample path; a flat
        // image must come out flat up to filter rounding.
        let flat = RgbImage::from_pixel(100, 80, Rgb([37, 200, 120]));
        let out = crop_scale(&flat, 64, CropScale::default());
        assert_eq!(out.dimensions(), (64, 64));
        for p in out.pixels() {
            for k in 0..3 {
                assert!((p[k] as i32 - flat.get_pixel(0, 0)[k] as i32).abs() <= 2);
            }
        }
    }

    #[test]
    fn seed_hash_is_stable_and_separating() {
        let a = seed_from_id("4bb6d5a4-3d67-4a26-8b3a-000000000001");
        let b = seed_from_id("4bb6d5a4-3d67-4a26-8b3a-000000000001");
        let c = seed_from_id("4bb6d5a4-3d67-4a26-8b3a-000000000002");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn self_target_gets_uniform_weights() {
        let settings = GenerationSettings::default(Uuid::nil(), "t".into());
        let (src, tgt, w) = get_images(gradient(64), &settings).unwrap();
        assert_eq!(src, tgt);
        assert!(w.iter().all(|&x| x == 255.0));
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let mut s = GenerationSettings::default(Uuid::nil(), "t".into());
        assert!(s.validate().is_ok());
        s.sidelen = 100;
        assert!(s.validate().is_err());
        s.sidelen = 128;
        s.proximity_importance = 0;
        assert!(s.validate().is_err());
        s.proximity_importance = 51;
        assert!(s.validate().is_err());
        s.proximity_importance = 13;
        s.source_crop.scale = 0.5;
        assert!(s.validate().is_err());
    }
}
