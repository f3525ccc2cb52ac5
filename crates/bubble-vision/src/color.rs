//! Color-range bubble segmentation.
//!
//! Bubbles are filled with near-uniform colors that differ per sender side,
//! so an HSV range mask plus connected components finds them without any
//! template assets. The value channel is contrast-equalized first so the
//! same ranges hold across day/night game themes.

use bubble_capture::Rect;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::locator::SenderKind;

const CLAHE_TILES: u32 = 8;
const CLAHE_CLIP: f64 = 2.0;

/// One HSV range to segment. Hue uses the 0..=179 scale; a `hsv_lower` hue
/// above `hsv_upper` wraps around through red.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorProfile {
    pub name: String,
    #[serde(default)]
    pub is_bot: bool,
    pub hsv_lower: [u8; 3],
    pub hsv_upper: [u8; 3],
    pub min_area: u32,
    pub max_area: u32,
}

impl ColorProfile {
    /// Which side this profile's bubbles belong to. The player's own bubble
    /// color is the profile named "self"; every other profile, bots
    /// included, is someone else talking.
    pub fn sender(&self) -> SenderKind {
        if self.name.eq_ignore_ascii_case("self") {
            SenderKind::Own
        } else {
            SenderKind::Other
        }
    }
}

/// A segmented region matching one profile, in frame-local coordinates.
/// Confidence is the component's bounding-box fill ratio; chat bubbles are
/// rectangular, so stray same-colored clutter scores visibly lower.
#[derive(Debug, Clone)]
pub struct ColorCandidate {
    pub rect: Rect,
    pub profile: String,
    pub sender: SenderKind,
    pub area: u32,
    pub confidence: f64,
}

/// The active set of segmentation profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorProfiles {
    pub profiles: Vec<ColorProfile>,
}

impl Default for ColorProfiles {
    fn default() -> Self {
        Self {
            profiles: vec![
                ColorProfile {
                    name: "self".to_string(),
                    is_bot: false,
                    hsv_lower: [35, 40, 120],
                    hsv_upper: [85, 255, 255],
                    min_area: 3000,
                    max_area: 100_000,
                },
                ColorProfile {
                    name: "other".to_string(),
                    is_bot: false,
                    hsv_lower: [0, 0, 180],
                    hsv_upper: [179, 40, 255],
                    min_area: 3000,
                    max_area: 100_000,
                },
            ],
        }
    }
}

impl ColorProfiles {
    /// Load profiles from a JSON file, keeping the built-in defaults when the
    /// file is absent or malformed.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    "Color profiles not loaded from {} ({}), using defaults",
                    path.display(),
                    e
                );
                return Self::default();
            }
        };
        match serde_json::from_str::<Self>(&raw) {
            Ok(profiles) => {
                info!(
                    "Loaded {} color profile(s) from {}",
                    profiles.profiles.len(),
                    path.display()
                );
                profiles
            }
            Err(e) => {
                warn!(
                    "Invalid color profiles in {} ({}), using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Segment a frame against every profile.
    pub fn detect(&self, frame: &RgbaImage) -> Vec<ColorCandidate> {
        let (w, h) = frame.dimensions();
        if w == 0 || h == 0 {
            return Vec::new();
        }

        let (hue, sat, mut val) = split_hsv(frame);
        equalize_value(&mut val, w, h);

        let mut out = Vec::new();
        for profile in &self.profiles {
            let mut mask = in_range(&hue, &sat, &val, profile);
            close_3x3(&mut mask, w, h);
            for comp in components(&mask, w, h) {
                if comp.area < profile.min_area || comp.area > profile.max_area {
                    continue;
                }
                let fill =
                    comp.area as f64 / (comp.rect.width as f64 * comp.rect.height as f64);
                out.push(ColorCandidate {
                    rect: comp.rect,
                    profile: profile.name.clone(),
                    sender: profile.sender(),
                    area: comp.area,
                    confidence: fill,
                });
            }
        }
        debug!("Color segmentation produced {} candidate(s)", out.len());
        out
    }
}

/// Split a frame into planar H/S/V channels on the OpenCV-style scale
/// (hue 0..=179, saturation and value 0..=255).
fn split_hsv(frame: &RgbaImage) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let n = (frame.width() * frame.height()) as usize;
    let mut hue = Vec::with_capacity(n);
    let mut sat = Vec::with_capacity(n);
    let mut val = Vec::with_capacity(n);
    for p in frame.pixels() {
        let (h, s, v) = rgb_to_hsv(p[0], p[1], p[2]);
        hue.push(h);
        sat.push(s);
        val.push(v);
    }
    (hue, sat, val)
}

fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (rf, gf, bf) = (r as f64, g as f64, b as f64);
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let v = max as u8;
    let s = if max <= 0.0 {
        0
    } else {
        ((delta / max) * 255.0).round() as u8
    };
    let h = if delta <= 0.0 {
        0.0
    } else if max == rf {
        60.0 * ((gf - bf) / delta)
    } else if max == gf {
        60.0 * ((bf - rf) / delta) + 120.0
    } else {
        60.0 * ((rf - gf) / delta) + 240.0
    };
    let h = if h < 0.0 { h + 360.0 } else { h };
    let h = ((h / 2.0).round() as i32).rem_euclid(180) as u8;
    (h, s, v)
}

/// CLAHE over the value plane: per-tile clipped histogram equalization with
/// bilinear blending between neighboring tile LUTs.
fn equalize_value(val: &mut [u8], w: u32, h: u32) {
    let tiles_x = CLAHE_TILES.min(w).max(1);
    let tiles_y = CLAHE_TILES.min(h).max(1);

    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * w / tiles_x;
            let x1 = (tx + 1) * w / tiles_x;
            let y0 = ty * h / tiles_y;
            let y1 = (ty + 1) * h / tiles_y;

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[val[(y * w + x) as usize] as usize] += 1;
                }
            }
            let n = (x1 - x0) * (y1 - y0);
            build_lut(&mut hist, n, &mut luts[(ty * tiles_x + tx) as usize]);
        }
    }

    let tile_w = w as f64 / tiles_x as f64;
    let tile_h = h as f64 / tiles_y as f64;
    for y in 0..h {
        let fy = (y as f64 + 0.5) / tile_h - 0.5;
        let ty0 = (fy.floor().max(0.0) as u32).min(tiles_y - 1);
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let wy = (fy - ty0 as f64).clamp(0.0, 1.0);
        for x in 0..w {
            let fx = (x as f64 + 0.5) / tile_w - 0.5;
            let tx0 = (fx.floor().max(0.0) as u32).min(tiles_x - 1);
            let tx1 = (tx0 + 1).min(tiles_x - 1);
            let wx = (fx - tx0 as f64).clamp(0.0, 1.0);

            let idx = (y * w + x) as usize;
            let v = val[idx] as usize;
            let tl = luts[(ty0 * tiles_x + tx0) as usize][v] as f64;
            let tr = luts[(ty0 * tiles_x + tx1) as usize][v] as f64;
            let bl = luts[(ty1 * tiles_x + tx0) as usize][v] as f64;
            let br = luts[(ty1 * tiles_x + tx1) as usize][v] as f64;
            let top = tl + (tr - tl) * wx;
            let bottom = bl + (br - bl) * wx;
            val[idx] = (top + (bottom - top) * wy).round() as u8;
        }
    }
}

/// Clip the histogram, redistribute the excess evenly, then turn the CDF
/// into a 0..=255 lookup table.
fn build_lut(hist: &mut [u32; 256], n: u32, lut: &mut [u8; 256]) {
    if n == 0 {
        for (i, slot) in lut.iter_mut().enumerate() {
            *slot = i as u8;
        }
        return;
    }

    let clip = ((CLAHE_CLIP * n as f64 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let bonus = excess / 256;
    let mut remainder = excess % 256;
    for bin in hist.iter_mut() {
        *bin += bonus;
        if remainder > 0 {
            *bin += 1;
            remainder -= 1;
        }
    }

    let mut cdf = 0u64;
    for (i, &bin) in hist.iter().enumerate() {
        cdf += bin as u64;
        lut[i] = ((cdf * 255) / n as u64) as u8;
    }
}

fn in_range(hue: &[u8], sat: &[u8], val: &[u8], profile: &ColorProfile) -> Vec<bool> {
    let [hl, sl, vl] = profile.hsv_lower;
    let [hu, su, vu] = profile.hsv_upper;
    let wraps = hl > hu;
    hue.iter()
        .zip(sat)
        .zip(val)
        .map(|((&h, &s), &v)| {
            let hue_ok = if wraps { h >= hl || h <= hu } else { h >= hl && h <= hu };
            hue_ok && s >= sl && s <= su && v >= vl && v <= vu
        })
        .collect()
}

/// Morphological close with a 3x3 square element. Bridges single-pixel gaps
/// left by anti-aliased bubble borders.
fn close_3x3(mask: &mut Vec<bool>, w: u32, h: u32) {
    let dilated = morph_3x3(mask, w, h, true);
    *mask = morph_3x3(&dilated, w, h, false);
}

fn morph_3x3(mask: &[bool], w: u32, h: u32, dilate: bool) -> Vec<bool> {
    let (wi, hi) = (w as i32, h as i32);
    let mut out = vec![false; mask.len()];
    for y in 0..hi {
        for x in 0..wi {
            let mut acc = !dilate;
            'probe: for dy in -1..=1 {
                for dx in -1..=1 {
                    let (nx, ny) = (x + dx, y + dy);
                    // Out-of-frame neighbors count as background.
                    let v = nx >= 0
                        && ny >= 0
                        && nx < wi
                        && ny < hi
                        && mask[(ny * wi + nx) as usize];
                    if dilate && v {
                        acc = true;
                        break 'probe;
                    }
                    if !dilate && !v {
                        acc = false;
                        break 'probe;
                    }
                }
            }
            out[(y * wi + x) as usize] = acc;
        }
    }
    out
}

struct Component {
    rect: Rect,
    area: u32,
}

/// 4-connected components over a binary mask.
fn components(mask: &[bool], w: u32, h: u32) -> Vec<Component> {
    let (wi, hi) = (w as i32, h as i32);
    let mut seen = vec![false; mask.len()];
    let mut out = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        stack.push(start);
        let (mut min_x, mut min_y) = ((start as i32) % wi, (start as i32) / wi);
        let (mut max_x, mut max_y) = (min_x, min_y);
        let mut area = 0u32;

        while let Some(idx) = stack.pop() {
            let (x, y) = ((idx as i32) % wi, (idx as i32) / wi);
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            for (dx, dy) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= wi || ny >= hi {
                    continue;
                }
                let nidx = (ny * wi + nx) as usize;
                if mask[nidx] && !seen[nidx] {
                    seen[nidx] = true;
                    stack.push(nidx);
                }
            }
        }

        out.push(Component {
            rect: Rect::new(
                min_x,
                min_y,
                (max_x - min_x + 1) as u32,
                (max_y - min_y + 1) as u32,
            ),
            area,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn profile(name: &str, lower: [u8; 3], upper: [u8; 3]) -> ColorProfile {
        ColorProfile {
            name: name.to_string(),
            is_bot: false,
            hsv_lower: lower,
            hsv_upper: upper,
            min_area: 200,
            max_area: 100_000,
        }
    }

    fn frame_with_block(color: Rgba<u8>, rect: Rect) -> RgbaImage {
        let mut frame = RgbaImage::from_pixel(160, 120, Rgba([0, 0, 0, 255]));
        for y in rect.top..rect.bottom() {
            for x in rect.left..rect.right() {
                frame.put_pixel(x as u32, y as u32, color);
            }
        }
        frame
    }

    #[test]
    fn test_green_block_segmented_with_exact_bbox() {
        let planted = Rect::new(30, 20, 60, 30);
        let frame = frame_with_block(Rgba([0, 200, 0, 255]), planted);
        let profiles = ColorProfiles {
            profiles: vec![profile("self", [35, 40, 0], [85, 255, 255])],
        };

        let found = profiles.detect(&frame);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rect, planted);
        assert_eq!(found[0].sender, SenderKind::Own);
        assert!(found[0].confidence > 0.95);
    }

    #[test]
    fn test_area_window_filters_small_blobs() {
        let frame = frame_with_block(Rgba([0, 200, 0, 255]), Rect::new(10, 10, 8, 8));
        let profiles = ColorProfiles {
            profiles: vec![profile("self", [35, 40, 0], [85, 255, 255])],
        };
        assert!(profiles.detect(&frame).is_empty());
    }

    #[test]
    fn test_hue_wraparound_matches_red() {
        // (200, 20, 40) sits just below hue 0 on the wheel, so only a
        // wrapped range catches it.
        let planted = Rect::new(40, 40, 40, 25);
        let frame = frame_with_block(Rgba([200, 20, 40, 255]), planted);
        let profiles = ColorProfiles {
            profiles: vec![profile("red", [170, 40, 0], [10, 255, 255])],
        };

        let found = profiles.detect(&frame);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rect, planted);
    }

    #[test]
    fn test_non_wrapping_range_misses_wrapped_hue() {
        let frame =
            frame_with_block(Rgba([200, 20, 40, 255]), Rect::new(40, 40, 40, 25));
        let profiles = ColorProfiles {
            profiles: vec![profile("blue", [100, 40, 0], [130, 255, 255])],
        };
        assert!(profiles.detect(&frame).is_empty());
    }

    #[test]
    fn test_fill_ratio_reflects_shape() {
        // An L-shape fills roughly half its bounding box.
        let mut frame = RgbaImage::from_pixel(160, 120, Rgba([0, 0, 0, 255]));
        let green = Rgba([0, 200, 0, 255]);
        for y in 20..60 {
            for x in 30..45 {
                frame.put_pixel(x, y, green);
            }
        }
        for y in 45..60 {
            for x in 45..90 {
                frame.put_pixel(x, y, green);
            }
        }
        let profiles = ColorProfiles {
            profiles: vec![profile("self", [35, 40, 0], [85, 255, 255])],
        };

        let found = profiles.detect(&frame);
        assert_eq!(found.len(), 1);
        assert!(found[0].confidence < 0.8);
        assert!(found[0].confidence > 0.3);
    }

    #[test]
    fn test_missing_profile_file_falls_back_to_defaults() {
        let loaded = ColorProfiles::load(Path::new("/definitely/not/here.json"));
        assert_eq!(loaded.profiles.len(), ColorProfiles::default().profiles.len());
    }

    #[test]
    fn test_rgb_to_hsv_known_values() {
        assert_eq!(rgb_to_hsv(0, 200, 0), (60, 255, 200));
        let (h, s, v) = rgb_to_hsv(230, 230, 230);
        assert_eq!((h, s), (0, 0));
        assert_eq!(v, 230);
    }
}
