//! Maps detection coordinates back to screen space and guards synthetic
//! input against landing outside the game window.
//!
//! Bubble captures are extended leftward to include the sender avatar, so a
//! box found inside one is shifted relative to the screen. Display scaling
//! (125%/150% Windows settings, Retina) additionally divorces the logical
//! window rectangle from capture pixels.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, warn};
use xcap::Monitor;

use crate::{Point, Rect};

static DISPLAY_SCALE: OnceLock<f64> = OnceLock::new();

/// Active display scale factor of the primary monitor, detected once and
/// cached for the process lifetime. Falls back to 1.0 when the query fails.
pub fn display_scale() -> f64 {
    *DISPLAY_SCALE.get_or_init(|| match query_scale() {
        Some(scale) if scale > 0.0 => {
            debug!("Display scale factor: {:.2}", scale);
            scale
        }
        _ => {
            warn!("Could not query display scale factor, assuming 1.0");
            1.0
        }
    })
}

fn query_scale() -> Option<f64> {
    let monitors = Monitor::all().ok()?;
    for monitor in monitors {
        if matches!(monitor.is_primary(), Ok(true)) {
            return monitor.scale_factor().ok().map(|f| f as f64);
        }
    }
    None
}

/// Safe-click-region settings: the logical game window rectangle and the
/// margin withheld from its edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeRegionConfig {
    /// Game window rectangle in logical (unscaled) coordinates.
    pub window: Rect,
    /// Pixels shaved off every edge of the scaled window.
    pub margin: u32,
    /// Apply the detected display scale factor to `window` before shrinking.
    pub apply_scaling: bool,
}

impl Default for SafeRegionConfig {
    fn default() -> Self {
        Self {
            window: Rect::new(50, 30, 600, 1070),
            margin: 10,
            apply_scaling: true,
        }
    }
}

/// Translates region-local detections to absolute screen coordinates and
/// validates interaction targets against the safe click region.
#[derive(Debug, Clone)]
pub struct Compensator {
    safe_region: Rect,
}

impl Compensator {
    pub fn new(config: &SafeRegionConfig) -> Self {
        let scale = if config.apply_scaling {
            display_scale()
        } else {
            1.0
        };
        let scaled = scale_rect(&config.window, scale);
        let safe_region = scaled.shrink(config.margin);
        debug!(
            "Safe click region: {:?} (scale {:.2}, margin {})",
            safe_region, scale, config.margin
        );
        Self { safe_region }
    }

    /// Build directly from an already-resolved safe region. Used by tests
    /// and callers that manage scaling themselves.
    pub fn with_safe_region(safe_region: Rect) -> Self {
        Self { safe_region }
    }

    /// Translate a box found inside an extended screenshot back to absolute
    /// coordinates by adding the horizontal capture offset.
    pub fn compensate_rect(&self, local: &Rect, extension: i32) -> Rect {
        Rect::new(local.left + extension, local.top, local.width, local.height)
    }

    pub fn compensate_point(&self, local: Point, extension: i32) -> Point {
        Point::new(local.x + extension, local.y)
    }

    pub fn safe_click_region(&self) -> Rect {
        self.safe_region
    }

    /// Whether a synthetic input target may be issued. Targets outside the
    /// safe region are rejected outright rather than clamped.
    pub fn validate_point(&self, target: Point) -> bool {
        let ok = self.safe_region.contains(target);
        if !ok {
            warn!(
                "Rejected input target ({}, {}) outside safe region {:?}",
                target.x, target.y, self.safe_region
            );
        }
        ok
    }
}

fn scale_rect(rect: &Rect, scale: f64) -> Rect {
    Rect::new(
        (rect.left as f64 * scale).round() as i32,
        (rect.top as f64 * scale).round() as i32,
        (rect.width as f64 * scale).round() as u32,
        (rect.height as f64 * scale).round() as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compensate_rect_adds_extension() {
        let c = Compensator::with_safe_region(Rect::new(0, 0, 1000, 1000));
        let local = Rect::new(12, 34, 100, 40);
        let abs = c.compensate_rect(&local, 50);
        assert_eq!(abs.left, local.left + 50);
        assert_eq!(abs.top, local.top);
        assert_eq!(abs.width, local.width);
    }

    #[test]
    fn test_scale_rect() {
        let r = scale_rect(&Rect::new(50, 30, 600, 1070), 1.5);
        assert_eq!(r, Rect::new(75, 45, 900, 1605));
    }

    #[test]
    fn test_validate_point() {
        let c = Compensator::with_safe_region(Rect::new(60, 40, 580, 1050));
        assert!(c.validate_point(Point::new(300, 500)));
        assert!(!c.validate_point(Point::new(10, 500)));
        assert!(!c.validate_point(Point::new(300, 2000)));
    }

    #[test]
    fn test_safe_region_shrinks_window() {
        let cfg = SafeRegionConfig {
            window: Rect::new(0, 0, 100, 100),
            margin: 10,
            apply_scaling: false,
        };
        let c = Compensator::new(&cfg);
        assert_eq!(c.safe_click_region(), Rect::new(10, 10, 80, 80));
    }
}
