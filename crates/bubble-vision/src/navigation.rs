//! Screen-state detection from fixed UI markers.
//!
//! Opening a bubble's sender profile navigates away from the chat room, and
//! capitol pages carry their own fixed headers. Each screen is identified by
//! a template anchor that only ever appears there, so "where are we" reduces
//! to asking the matcher which markers are currently visible.

use bubble_capture::Rect;
use image::RgbaImage;
use std::sync::Arc;
use tracing::debug;

use crate::template::TemplateMatcher;

/// A screen or page element identified by its own template anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    ChatRoom,
    ProfileCard,
    ProfileDetail,
    CapitolTitle,
    PositionDevelopment,
    PositionInterior,
    PositionScience,
    PositionSecurity,
    PositionStrategy,
}

impl Marker {
    pub const ALL: [Marker; 9] = [
        Marker::ChatRoom,
        Marker::ProfileCard,
        Marker::ProfileDetail,
        Marker::CapitolTitle,
        Marker::PositionDevelopment,
        Marker::PositionInterior,
        Marker::PositionScience,
        Marker::PositionSecurity,
        Marker::PositionStrategy,
    ];

    /// The capitol position buttons, in on-screen order.
    pub const POSITIONS: [Marker; 5] = [
        Marker::PositionDevelopment,
        Marker::PositionInterior,
        Marker::PositionScience,
        Marker::PositionSecurity,
        Marker::PositionStrategy,
    ];

    pub fn anchor(&self) -> &'static str {
        match self {
            Marker::ChatRoom => "chat_room",
            Marker::ProfileCard => "profile_page",
            Marker::ProfileDetail => "profile_name_page",
            Marker::CapitolTitle => "president_title",
            Marker::PositionDevelopment => "position_development",
            Marker::PositionInterior => "position_interior",
            Marker::PositionScience => "position_science",
            Marker::PositionSecurity => "position_security",
            Marker::PositionStrategy => "position_strategy",
        }
    }
}

/// A marker found on screen, with the best-scoring location.
#[derive(Debug, Clone)]
pub struct MarkerHit {
    pub marker: Marker,
    pub rect: Rect,
    pub confidence: f64,
}

/// Stateless screen-state detector; every call inspects the frame fresh.
pub struct NavigationDetector {
    matcher: Arc<TemplateMatcher>,
    confidence: f64,
}

impl NavigationDetector {
    pub fn new(matcher: Arc<TemplateMatcher>, confidence: f64) -> Self {
        Self {
            matcher,
            confidence,
        }
    }

    /// Which of the given markers are visible, reporting the single best
    /// location per marker.
    pub fn detect(&self, frame: &RgbaImage, markers: &[Marker]) -> Vec<MarkerHit> {
        let gray = image::imageops::grayscale(frame);
        let mut hits = Vec::new();
        for &marker in markers {
            let best = self
                .matcher
                .find(&gray, marker.anchor(), self.confidence)
                .into_iter()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
            if let Some(hit) = best {
                debug!(
                    "Marker {:?} at ({}, {}) confidence {:.2}",
                    marker, hit.rect.left, hit.rect.top, hit.confidence
                );
                hits.push(MarkerHit {
                    marker,
                    rect: hit.rect,
                    confidence: hit.confidence,
                });
            }
        }
        hits
    }

    /// Whether a single marker is currently visible.
    pub fn is_visible(&self, frame: &RgbaImage, marker: Marker) -> bool {
        !self.detect(frame, &[marker]).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn textured(w: u32, h: u32, seed: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            Luma([((x * 31 + y * 17 + seed * 101) % 251) as u8])
        })
    }

    fn plant(frame: &mut GrayImage, patch: &GrayImage, px: u32, py: u32) {
        for y in 0..patch.height() {
            for x in 0..patch.width() {
                frame.put_pixel(px + x, py + y, *patch.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn test_detects_planted_marker() {
        let patch = textured(14, 10, 3);
        let mut frame = GrayImage::from_pixel(150, 100, Luma([30]));
        plant(&mut frame, &patch, 60, 20);

        let mut matcher = TemplateMatcher::empty();
        matcher.insert(Marker::ChatRoom.anchor(), "default", patch);
        let detector = NavigationDetector::new(Arc::new(matcher), 0.7);

        let rgba = image::DynamicImage::ImageLuma8(frame).to_rgba8();
        let hits = detector.detect(&rgba, &[Marker::ChatRoom, Marker::ProfileCard]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].marker, Marker::ChatRoom);
        assert_eq!((hits[0].rect.left, hits[0].rect.top), (60, 20));
    }

    #[test]
    fn test_absent_marker_not_visible() {
        let matcher = TemplateMatcher::empty();
        let detector = NavigationDetector::new(Arc::new(matcher), 0.7);
        let frame = RgbaImage::new(100, 80);
        assert!(!detector.is_visible(&frame, Marker::ProfileDetail));
    }

    #[test]
    fn test_one_hit_per_marker() {
        let patch = textured(12, 12, 7);
        let mut frame = GrayImage::from_pixel(200, 80, Luma([25]));
        plant(&mut frame, &patch, 20, 30);
        plant(&mut frame, &patch, 150, 30);

        let mut matcher = TemplateMatcher::empty();
        matcher.insert(Marker::CapitolTitle.anchor(), "default", patch);
        let detector = NavigationDetector::new(Arc::new(matcher), 0.7);

        let rgba = image::DynamicImage::ImageLuma8(frame).to_rgba8();
        let hits = detector.detect(&rgba, &[Marker::CapitolTitle]);
        assert_eq!(hits.len(), 1);
    }
}
