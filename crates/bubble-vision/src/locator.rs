//! Bubble location by two independent methods, reconciled into one list.
//!
//! The template method pairs bubble-corner anchors; the color method
//! segments bubble fills. Each covers the other's blind spots: templates
//! survive busy backgrounds, color survives corner skins that ship with
//! seasonal themes. Agreeing detections merge; a detection seen by only one
//! method must clear a stricter confidence bar.

use bubble_capture::Rect;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::color::ColorProfiles;
use crate::template::TemplateMatcher;

/// Anchor names the locator looks up in the template matcher.
pub mod anchors {
    pub const CORNER_TL: &str = "corner_tl";
    pub const CORNER_BR: &str = "corner_br";
    pub const BOT_CORNER_TL: &str = "bot_corner_tl";
    pub const BOT_CORNER_BR: &str = "bot_corner_br";
}

/// Which side of the conversation a bubble belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderKind {
    #[serde(rename = "self")]
    Own,
    #[serde(rename = "other")]
    Other,
}

/// A located chat bubble in frame-local coordinates.
#[derive(Debug, Clone)]
pub struct BubbleRegion {
    pub rect: Rect,
    pub sender: SenderKind,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// Per-method detection threshold.
    pub confidence: f64,
    /// Bar for detections only one method produced.
    pub single_method_confidence: f64,
    /// Top-left corner distance under which two detections are the same bubble.
    pub merge_distance: f64,
    pub min_bubble_width: u32,
    pub min_bubble_height: u32,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            confidence: 0.8,
            single_method_confidence: 0.85,
            merge_distance: 10.0,
            min_bubble_width: 20,
            min_bubble_height: 10,
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    rect: Rect,
    sender: SenderKind,
    confidence: f64,
}

pub struct BubbleLocator {
    matcher: Arc<TemplateMatcher>,
    profiles: ColorProfiles,
    config: LocatorConfig,
}

impl BubbleLocator {
    pub fn new(
        matcher: Arc<TemplateMatcher>,
        profiles: ColorProfiles,
        config: LocatorConfig,
    ) -> Self {
        Self {
            matcher,
            profiles,
            config,
        }
    }

    /// Locate every chat bubble in a frame.
    pub fn locate(&self, frame: &RgbaImage) -> Vec<BubbleRegion> {
        let gray = image::imageops::grayscale(frame);

        let mut template = self.pair_corners(&gray, anchors::CORNER_TL, anchors::CORNER_BR);
        template.extend(self.pair_corners(&gray, anchors::BOT_CORNER_TL, anchors::BOT_CORNER_BR));

        let color: Vec<Candidate> = self
            .profiles
            .detect(frame)
            .into_iter()
            .filter(|c| self.size_ok(&c.rect))
            .map(|c| Candidate {
                rect: c.rect,
                sender: c.sender,
                confidence: c.confidence,
            })
            .collect();

        let bubbles = reconcile(template, color, &self.config);
        debug!("Located {} bubble(s)", bubbles.len());
        bubbles
    }

    /// Pair each top-left corner hit with the nearest bottom-right hit that
    /// lies right of and below it. A corner hit without a partner is noise
    /// and is dropped.
    fn pair_corners(
        &self,
        gray: &image::GrayImage,
        tl_anchor: &str,
        br_anchor: &str,
    ) -> Vec<Candidate> {
        let tls = self.matcher.find(gray, tl_anchor, self.config.confidence);
        if tls.is_empty() {
            return Vec::new();
        }
        let brs = self.matcher.find(gray, br_anchor, self.config.confidence);

        let mut used = vec![false; brs.len()];
        let mut out = Vec::new();
        for tl in &tls {
            let mut best: Option<(usize, f64)> = None;
            for (i, br) in brs.iter().enumerate() {
                if used[i] || br.rect.left <= tl.rect.left || br.rect.top <= tl.rect.top {
                    continue;
                }
                let d = tl.rect.corner_distance(&br.rect);
                if best.map_or(true, |(_, bd)| d < bd) {
                    best = Some((i, d));
                }
            }
            let Some((i, _)) = best else { continue };
            used[i] = true;

            let br = &brs[i];
            let rect = Rect::new(
                tl.rect.left,
                tl.rect.top,
                (br.rect.right() - tl.rect.left) as u32,
                (br.rect.bottom() - tl.rect.top) as u32,
            );
            if !self.size_ok(&rect) {
                continue;
            }
            out.push(Candidate {
                rect,
                // Corner anchors carry no side information; color decides
                // during reconciliation when it saw the same bubble.
                sender: SenderKind::Other,
                confidence: tl.confidence.min(br.confidence),
            });
        }
        out
    }

    fn size_ok(&self, rect: &Rect) -> bool {
        rect.width >= self.config.min_bubble_width && rect.height >= self.config.min_bubble_height
    }
}

/// Merge the two method's candidate lists. Agreeing pairs take geometry from
/// the more confident method and the sender side from color; singletons must
/// clear `single_method_confidence`.
fn reconcile(
    template: Vec<Candidate>,
    color: Vec<Candidate>,
    config: &LocatorConfig,
) -> Vec<BubbleRegion> {
    let mut color_used = vec![false; color.len()];
    let mut merged = Vec::new();

    for t in &template {
        let mut best: Option<(usize, f64)> = None;
        for (i, c) in color.iter().enumerate() {
            if color_used[i] {
                continue;
            }
            let d = t.rect.corner_distance(&c.rect);
            if d <= config.merge_distance && best.map_or(true, |(_, bd)| d < bd) {
                best = Some((i, d));
            }
        }
        match best {
            Some((i, _)) => {
                color_used[i] = true;
                let c = &color[i];
                let rect = if t.confidence >= c.confidence {
                    t.rect
                } else {
                    c.rect
                };
                merged.push(BubbleRegion {
                    rect,
                    sender: c.sender,
                    confidence: t.confidence.max(c.confidence),
                });
            }
            None => {
                if t.confidence >= config.single_method_confidence {
                    merged.push(BubbleRegion {
                        rect: t.rect,
                        sender: t.sender,
                        confidence: t.confidence,
                    });
                }
            }
        }
    }

    for (i, c) in color.into_iter().enumerate() {
        if !color_used[i] && c.confidence >= config.single_method_confidence {
            merged.push(BubbleRegion {
                rect: c.rect,
                sender: c.sender,
                confidence: c.confidence,
            });
        }
    }

    dedup_overlaps(merged, config.merge_distance)
}

/// Keep the most confident of any regions still landing on the same spot,
/// e.g. a normal and a bot corner pair around one bubble.
fn dedup_overlaps(mut regions: Vec<BubbleRegion>, merge_distance: f64) -> Vec<BubbleRegion> {
    regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BubbleRegion> = Vec::new();
    for region in regions {
        if kept
            .iter()
            .all(|k| k.rect.corner_distance(&region.rect) > merge_distance)
        {
            kept.push(region);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(left: i32, top: i32, confidence: f64, sender: SenderKind) -> Candidate {
        Candidate {
            rect: Rect::new(left, top, 120, 48),
            sender,
            confidence,
        }
    }

    #[test]
    fn test_agreeing_methods_merge_with_color_sender() {
        let template = vec![cand(100, 200, 0.82, SenderKind::Other)];
        let color = vec![cand(104, 203, 0.95, SenderKind::Own)];

        let out = reconcile(template, color, &LocatorConfig::default());
        assert_eq!(out.len(), 1);
        // Color saw it more confidently, so its geometry wins; its sender
        // side always does.
        assert_eq!(out[0].rect.left, 104);
        assert_eq!(out[0].sender, SenderKind::Own);
        assert!((out[0].confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_template_geometry_wins_when_more_confident() {
        let template = vec![cand(100, 200, 0.97, SenderKind::Other)];
        let color = vec![cand(104, 203, 0.86, SenderKind::Own)];

        let out = reconcile(template, color, &LocatorConfig::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rect.left, 100);
        assert_eq!(out[0].sender, SenderKind::Own);
    }

    #[test]
    fn test_distant_detections_stay_separate() {
        let template = vec![cand(100, 100, 0.9, SenderKind::Other)];
        let color = vec![cand(100, 300, 0.9, SenderKind::Own)];

        let out = reconcile(template, color, &LocatorConfig::default());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_weak_single_method_detection_dropped() {
        let template = vec![cand(100, 100, 0.81, SenderKind::Other)];
        let out = reconcile(template, Vec::new(), &LocatorConfig::default());
        assert!(out.is_empty());

        let color = vec![cand(100, 100, 0.81, SenderKind::Own)];
        let out = reconcile(Vec::new(), color, &LocatorConfig::default());
        assert!(out.is_empty());
    }

    #[test]
    fn test_strong_single_method_detection_kept() {
        let color = vec![cand(100, 100, 0.9, SenderKind::Own)];
        let out = reconcile(Vec::new(), color, &LocatorConfig::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sender, SenderKind::Own);
    }

    #[test]
    fn test_overlapping_results_deduplicated() {
        // Normal and bot corner pairs around the same bubble.
        let template = vec![
            cand(100, 100, 0.9, SenderKind::Other),
            cand(103, 102, 0.95, SenderKind::Other),
        ];
        let out = reconcile(template, Vec::new(), &LocatorConfig::default());
        assert_eq!(out.len(), 1);
        assert!((out[0].confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_corner_pairing_builds_bubble_rect() {
        use image::{GrayImage, Luma};

        let tl = GrayImage::from_fn(8, 8, |x, y| Luma([((x * 37 + y * 11) % 253) as u8]));
        let br = GrayImage::from_fn(8, 8, |x, y| Luma([((x * 13 + y * 29) % 251) as u8]));

        let mut frame = GrayImage::from_pixel(200, 150, Luma([20]));
        for (patch, px, py) in [(&tl, 40u32, 30u32), (&br, 140, 90)] {
            for y in 0..8 {
                for x in 0..8 {
                    frame.put_pixel(px + x, py + y, *patch.get_pixel(x, y));
                }
            }
        }

        let mut matcher = TemplateMatcher::empty();
        matcher.insert(anchors::CORNER_TL, "default", tl);
        matcher.insert(anchors::CORNER_BR, "default", br);

        let locator = BubbleLocator::new(
            Arc::new(matcher),
            ColorProfiles { profiles: Vec::new() },
            LocatorConfig {
                single_method_confidence: 0.85,
                ..LocatorConfig::default()
            },
        );
        let rgba = image::DynamicImage::ImageLuma8(frame).to_rgba8();
        let bubbles = locator.locate(&rgba);

        assert_eq!(bubbles.len(), 1);
        assert_eq!(bubbles[0].rect, Rect::new(40, 30, 108, 68));
    }

    #[test]
    fn test_unpaired_corner_is_noise() {
        use image::{GrayImage, Luma};

        let tl = GrayImage::from_fn(8, 8, |x, y| Luma([((x * 37 + y * 11) % 253) as u8]));
        let mut frame = GrayImage::from_pixel(120, 90, Luma([20]));
        for y in 0..8 {
            for x in 0..8 {
                frame.put_pixel(50 + x, 40 + y, *tl.get_pixel(x, y));
            }
        }

        let mut matcher = TemplateMatcher::empty();
        matcher.insert(anchors::CORNER_TL, "default", tl);

        let locator = BubbleLocator::new(
            Arc::new(matcher),
            ColorProfiles { profiles: Vec::new() },
            LocatorConfig::default(),
        );
        let rgba = image::DynamicImage::ImageLuma8(frame).to_rgba8();
        assert!(locator.locate(&rgba).is_empty());
    }
}
