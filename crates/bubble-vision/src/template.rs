use anyhow::{Context, Result};
use bubble_capture::Rect;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// One skin variant of a named anchor, declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkinSpec {
    pub id: String,
    pub file: String,
}

/// A named visual anchor with an ordered list of skin variants, tried in
/// declaration order at match time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorSpec {
    pub name: String,
    pub skins: Vec<SkinSpec>,
}

/// Pre-processed skin template with cached statistics for NCC.
struct SkinTemplate {
    id: String,
    gray: GrayImage,
    mean: f64,
    std_dev: f64,
}

/// A template match inside a frame, in frame-local coordinates.
#[derive(Debug, Clone)]
pub struct TemplateHit {
    pub rect: Rect,
    pub confidence: f64,
    pub skin: String,
}

/// Finds named anchors (bubble corners, keywords, screen-state markers) in
/// frames via sliding normalized cross-correlation. A skin whose image file
/// is missing from disk is logged once at load and simply never matches.
pub struct TemplateMatcher {
    anchors: HashMap<String, Vec<SkinTemplate>>,
}

impl TemplateMatcher {
    pub fn empty() -> Self {
        Self {
            anchors: HashMap::new(),
        }
    }

    /// Load anchor templates from the assets directory.
    pub fn load(assets_dir: &Path, specs: &[AnchorSpec]) -> Self {
        let mut anchors: HashMap<String, Vec<SkinTemplate>> = HashMap::new();
        let mut loaded = 0usize;

        for spec in specs {
            let skins = anchors.entry(spec.name.clone()).or_default();
            for skin in &spec.skins {
                let path = assets_dir.join(&skin.file);
                if !path.exists() {
                    warn!(
                        "Template missing for anchor '{}' skin '{}': {} (skin disabled)",
                        spec.name,
                        skin.id,
                        path.display()
                    );
                    continue;
                }
                match load_skin(&path, &skin.id) {
                    Ok(tmpl) => {
                        skins.push(tmpl);
                        loaded += 1;
                    }
                    Err(e) => warn!(
                        "Failed to load template for anchor '{}' skin '{}': {}",
                        spec.name, skin.id, e
                    ),
                }
            }
        }

        info!(
            "TemplateMatcher loaded {} skin template(s) across {} anchor(s) from {}",
            loaded,
            anchors.len(),
            assets_dir.display()
        );
        Self { anchors }
    }

    /// Register a template directly. Used by tests and snapshot re-location.
    pub fn insert(&mut self, anchor: &str, skin: &str, gray: GrayImage) {
        let (mean, std_dev) = compute_stats(&gray);
        self.anchors
            .entry(anchor.to_string())
            .or_default()
            .push(SkinTemplate {
                id: skin.to_string(),
                gray,
                mean,
                std_dev,
            });
    }

    pub fn has_anchor(&self, anchor: &str) -> bool {
        self.anchors
            .get(anchor)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    /// Find all occurrences of an anchor in a frame. Every skin variant is
    /// tried; overlapping hits within half a template size are merged,
    /// keeping the highest-confidence skin. An unknown or asset-less anchor
    /// yields no hits, never an error.
    pub fn find(&self, frame: &GrayImage, anchor: &str, threshold: f64) -> Vec<TemplateHit> {
        let Some(skins) = self.anchors.get(anchor) else {
            return Vec::new();
        };

        let mut hits = Vec::new();
        for tmpl in skins {
            scan_template(frame, tmpl, threshold, &mut hits);
        }
        if hits.is_empty() {
            return hits;
        }

        // Merge plateau hits from stride-1 scanning and agreeing skins.
        let tolerance = skins
            .iter()
            .map(|t| (t.gray.width().min(t.gray.height()) / 2).max(4) as i32)
            .max()
            .unwrap_or(4);
        let merged = merge_hits(hits, tolerance);
        debug!(
            "Anchor '{}': {} hit(s) at threshold {:.2}",
            anchor,
            merged.len(),
            threshold
        );
        merged
    }
}

/// Best-scoring position of an arbitrary template inside a frame, used to
/// re-locate a stored bubble snapshot inside its recorded search area.
/// Returns `None` when the template does not fit in the frame.
pub fn best_match(frame: &GrayImage, template: &GrayImage) -> Option<TemplateHit> {
    let (fw, fh) = frame.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > fw || th > fh {
        return None;
    }
    let (mean_t, std_t) = compute_stats(template);
    if std_t < 1e-10 {
        return None;
    }

    let n = (tw * th) as f64;
    let tpix: Vec<f64> = template.pixels().map(|p| p[0] as f64).collect();
    let mut best: Option<TemplateHit> = None;

    for wy in 0..=(fh - th) {
        for wx in 0..=(fw - tw) {
            let score = ncc_at(frame, wx, wy, tw, th, &tpix, mean_t, std_t, n);
            if best
                .as_ref()
                .map_or(true, |b| score > b.confidence)
            {
                best = Some(TemplateHit {
                    rect: Rect::new(wx as i32, wy as i32, tw, th),
                    confidence: score,
                    skin: "snapshot".to_string(),
                });
            }
        }
    }
    best
}

fn load_skin(path: &Path, id: &str) -> Result<SkinTemplate> {
    let img = image::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let gray = img.to_luma8();
    let (mean, std_dev) = compute_stats(&gray);
    Ok(SkinTemplate {
        id: id.to_string(),
        gray,
        mean,
        std_dev,
    })
}

/// Slide one template over the frame, collecting windows whose zero-mean
/// NCC meets the threshold.
fn scan_template(frame: &GrayImage, tmpl: &SkinTemplate, threshold: f64, out: &mut Vec<TemplateHit>) {
    let (fw, fh) = frame.dimensions();
    let (tw, th) = tmpl.gray.dimensions();
    if tw == 0 || th == 0 || tw > fw || th > fh {
        return;
    }
    if tmpl.std_dev < 1e-10 {
        // A flat template correlates with nothing meaningful.
        return;
    }

    let n = (tw * th) as f64;
    let tpix: Vec<f64> = tmpl.gray.pixels().map(|p| p[0] as f64).collect();

    for wy in 0..=(fh - th) {
        for wx in 0..=(fw - tw) {
            let score = ncc_at(frame, wx, wy, tw, th, &tpix, tmpl.mean, tmpl.std_dev, n);
            if score >= threshold {
                out.push(TemplateHit {
                    rect: Rect::new(wx as i32, wy as i32, tw, th),
                    confidence: score,
                    skin: tmpl.id.clone(),
                });
            }
        }
    }
}

/// Zero-mean NCC between one frame window and a template with precomputed
/// statistics. `tpix` holds the template pixels row-major as f64.
#[allow(clippy::too_many_arguments)]
fn ncc_at(
    frame: &GrayImage,
    wx: u32,
    wy: u32,
    tw: u32,
    th: u32,
    tpix: &[f64],
    mean_t: f64,
    std_t: f64,
    n: f64,
) -> f64 {
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut cross = 0.0f64;
    let mut i = 0usize;
    for dy in 0..th {
        for dx in 0..tw {
            let v = frame.get_pixel(wx + dx, wy + dy)[0] as f64;
            sum += v;
            sum_sq += v * v;
            cross += v * tpix[i];
            i += 1;
        }
    }
    let mean_w = sum / n;
    let var_w = (sum_sq / n - mean_w * mean_w).max(0.0);
    let denom = n * var_w.sqrt() * std_t;
    if denom < 1e-10 {
        0.0
    } else {
        (cross - n * mean_w * mean_t) / denom
    }
}

/// Greedy non-maximum suppression on top-left distance.
fn merge_hits(mut hits: Vec<TemplateHit>, tolerance: i32) -> Vec<TemplateHit> {
    hits.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<TemplateHit> = Vec::new();
    for hit in hits {
        let overlaps = kept.iter().any(|k| {
            (k.rect.left - hit.rect.left).abs() <= tolerance
                && (k.rect.top - hit.rect.top).abs() <= tolerance
        });
        if !overlaps {
            kept.push(hit);
        }
    }
    kept
}

fn compute_stats(img: &GrayImage) -> (f64, f64) {
    let n = (img.width() * img.height()) as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let sum: f64 = img.pixels().map(|p| p[0] as f64).sum();
    let mean = sum / n;
    let variance = img
        .pixels()
        .map(|p| {
            let d = p[0] as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn textured(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            Luma([(x.wrapping_mul(31).wrapping_add(y.wrapping_mul(17)) % 251) as u8])
        })
    }

    /// Frame with a distinct textured patch planted at (px, py).
    fn frame_with_patch(patch: &GrayImage, px: u32, py: u32) -> GrayImage {
        let mut frame = GrayImage::from_pixel(120, 90, Luma([40]));
        for y in 0..patch.height() {
            for x in 0..patch.width() {
                frame.put_pixel(px + x, py + y, *patch.get_pixel(x, y));
            }
        }
        frame
    }

    #[test]
    fn test_finds_planted_template() {
        let patch = textured(12, 10);
        let frame = frame_with_patch(&patch, 37, 22);

        let mut matcher = TemplateMatcher::empty();
        matcher.insert("corner_tl", "default", patch);

        let hits = matcher.find(&frame, "corner_tl", 0.9);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rect.left, 37);
        assert_eq!(hits[0].rect.top, 22);
        assert!(hits[0].confidence > 0.99);
    }

    #[test]
    fn test_highest_confidence_skin_wins() {
        let patch = textured(12, 10);
        // Second skin is a noisy copy of the first; both match near the same
        // spot and must merge into a single hit tagged with the exact skin.
        let noisy = GrayImage::from_fn(12, 10, |x, y| {
            Luma([patch.get_pixel(x, y)[0].saturating_add(((x + y) % 5) as u8 * 9)])
        });
        let frame = frame_with_patch(&patch, 50, 30);

        let mut matcher = TemplateMatcher::empty();
        matcher.insert("corner_tl", "noisy", noisy);
        matcher.insert("corner_tl", "exact", patch);

        let hits = matcher.find(&frame, "corner_tl", 0.7);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].skin, "exact");
    }

    #[test]
    fn test_unknown_anchor_returns_empty() {
        let matcher = TemplateMatcher::empty();
        let frame = textured(50, 50);
        assert!(matcher.find(&frame, "no_such_anchor", 0.8).is_empty());
    }

    #[test]
    fn test_missing_asset_degrades_to_no_match() {
        let dir = std::env::temp_dir();
        let specs = [AnchorSpec {
            name: "corner_tl".to_string(),
            skins: vec![SkinSpec {
                id: "default".to_string(),
                file: "definitely_not_present_xyz.png".to_string(),
            }],
        }];
        let matcher = TemplateMatcher::load(&dir, &specs);
        let frame = textured(60, 60);
        assert!(matcher.find(&frame, "corner_tl", 0.8).is_empty());
    }

    #[test]
    fn test_flat_template_never_matches() {
        let mut matcher = TemplateMatcher::empty();
        matcher.insert("flat", "default", GrayImage::from_pixel(8, 8, Luma([128])));
        let frame = GrayImage::from_pixel(40, 40, Luma([128]));
        assert!(matcher.find(&frame, "flat", 0.5).is_empty());
    }

    #[test]
    fn test_best_match_locates_snapshot() {
        let patch = textured(20, 14);
        let frame = frame_with_patch(&patch, 11, 43);
        let hit = best_match(&frame, &patch).unwrap();
        assert_eq!((hit.rect.left, hit.rect.top), (11, 43));
        assert!(hit.confidence > 0.99);
    }

    #[test]
    fn test_template_larger_than_frame() {
        let patch = textured(30, 30);
        let frame = textured(20, 20);
        assert!(best_match(&frame, &patch).is_none());
    }
}
