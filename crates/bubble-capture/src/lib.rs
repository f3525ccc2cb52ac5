use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::warn;
use xcap::Monitor;

pub mod compensate;

pub use compensate::{Compensator, SafeRegionConfig};

/// Absolute pixel point on the target display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Pixel rectangle. `left`/`top` may be negative when a capture region is
/// extended past the window edge; width/height are always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> i32 {
        self.left + self.width as i32
    }

    pub fn bottom(&self) -> i32 {
        self.top + self.height as i32
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.left + self.width as i32 / 2,
            self.top + self.height as i32 / 2,
        )
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.left && p.x < self.right() && p.y >= self.top && p.y < self.bottom()
    }

    /// Grow the rectangle `margin` pixels to the left, clamping at x = 0.
    /// Used to pull the sender avatar into a bubble capture.
    pub fn extend_left(&self, margin: u32) -> Rect {
        let new_left = (self.left - margin as i32).max(0);
        let gained = (self.left - new_left) as u32;
        Rect::new(new_left, self.top, self.width + gained, self.height)
    }

    /// Shrink by `margin` pixels on every side. Collapses to a zero-size
    /// rectangle at the center when the margin exceeds the extent.
    pub fn shrink(&self, margin: u32) -> Rect {
        let m2 = margin.saturating_mul(2);
        Rect::new(
            self.left + margin as i32,
            self.top + margin as i32,
            self.width.saturating_sub(m2),
            self.height.saturating_sub(m2),
        )
    }

    /// Distance between the top-left corners of two rectangles.
    pub fn corner_distance(&self, other: &Rect) -> f64 {
        let dx = (self.left - other.left) as f64;
        let dy = (self.top - other.top) as f64;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn to_array(&self) -> [i32; 4] {
        [self.left, self.top, self.width as i32, self.height as i32]
    }

    pub fn from_array(a: [i32; 4]) -> Rect {
        Rect::new(a[0], a[1], a[2].max(0) as u32, a[3].max(0) as u32)
    }
}

/// Find the primary monitor, falling back to the first one enumerated.
fn primary_monitor() -> Result<Monitor> {
    let monitors = Monitor::all().context("Failed to enumerate monitors")?;
    let mut first = None;
    for monitor in monitors {
        if matches!(monitor.is_primary(), Ok(true)) {
            return Ok(monitor);
        }
        if first.is_none() {
            first = Some(monitor);
        }
    }
    first.ok_or_else(|| anyhow!("No monitors found"))
}

/// Capture a pixel region of the primary display. The full monitor frame is
/// grabbed and cropped; xcap has no partial-capture API.
pub fn capture_screen_region(region: &Rect) -> Result<RgbaImage> {
    let monitor = primary_monitor()?;
    let frame = monitor
        .capture_image()
        .context("Failed to capture monitor image")?;
    Ok(crop_rect(&frame, region))
}

/// Crop a pixel rectangle out of a frame, clamped to the frame bounds.
/// A rectangle entirely outside the frame yields an empty image.
pub fn crop_rect(frame: &RgbaImage, rect: &Rect) -> RgbaImage {
    let (w, h) = (frame.width(), frame.height());
    let x = rect.left.clamp(0, w as i32) as u32;
    let y = rect.top.clamp(0, h as i32) as u32;
    let rw = (rect.right().clamp(0, w as i32) as u32).saturating_sub(x);
    let rh = (rect.bottom().clamp(0, h as i32) as u32).saturating_sub(y);
    if rw == 0 || rh == 0 {
        warn!(
            "Crop {:?} lies outside the {}x{} frame, returning empty image",
            rect, w, h
        );
        return RgbaImage::new(0, 0);
    }
    image::imageops::crop_imm(frame, x, y, rw, rh).to_image()
}
