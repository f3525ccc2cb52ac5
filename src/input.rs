//! Live screen and input backends for the engine traits.
//!
//! Text is read with the Tesseract CLI on temp-file crops; when the binary
//! is not installed both extraction paths degrade to `None` and the engine
//! keeps polling without ever triggering.

use anyhow::Result;
use enigo::{Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use image::{GrayImage, RgbaImage};
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use bubble_capture::{capture_screen_region, Point, Rect};

use crate::engine::{FrameSource, UiActor};

/// Delay for the profile page to render after clicking an avatar.
const PROFILE_SETTLE_MS: u64 = 400;

/// Captures regions of the primary monitor.
pub struct LiveFrameSource;

impl FrameSource for LiveFrameSource {
    fn capture(&mut self, region: &Rect) -> Result<RgbaImage> {
        capture_screen_region(region)
    }
}

/// Drives the real mouse and keyboard and reads text via Tesseract.
pub struct LiveUiActor {
    enigo: Enigo,
    tesseract_available: bool,
    temp_dir: PathBuf,
    /// Absolute rectangle the sender name appears in once a profile is open.
    sender_name_region: Rect,
}

impl LiveUiActor {
    pub fn new(sender_name_region: Rect) -> Result<Self> {
        let enigo = Enigo::new(&Settings::default())
            .map_err(|e| anyhow::anyhow!("Failed to initialise input backend: {}", e))?;

        let tesseract_available = check_tesseract();
        if !tesseract_available {
            warn!("Tesseract not found, text extraction disabled");
        }

        let temp_dir = std::env::temp_dir().join("bubblebot_ocr");
        let _ = std::fs::create_dir_all(&temp_dir);

        Ok(Self {
            enigo,
            tesseract_available,
            temp_dir,
            sender_name_region,
        })
    }

    fn run_tesseract(&self, image: &GrayImage) -> Option<String> {
        let temp_path = self.temp_dir.join("ocr_input.png");
        if image.save(&temp_path).is_err() {
            return None;
        }

        let output = Command::new("tesseract")
            .arg(&temp_path)
            .arg("stdout")
            .arg("--psm")
            .arg("6")
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }

        let text = String::from_utf8(output.stdout).ok()?;
        let trimmed = text.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            debug!("OCR result: '{}'", trimmed);
            Some(trimmed)
        }
    }
}

impl UiActor for LiveUiActor {
    fn extract_text(&mut self, bubble: &RgbaImage) -> Result<Option<String>> {
        if !self.tesseract_available {
            return Ok(None);
        }
        Ok(self.run_tesseract(&preprocess_for_ocr(bubble)))
    }

    fn extract_sender(&mut self, avatar: Point) -> Result<Option<String>> {
        if !self.tesseract_available {
            return Ok(None);
        }
        // Open the profile page behind the avatar, then read the name off it.
        self.click(avatar)?;
        thread::sleep(Duration::from_millis(PROFILE_SETTLE_MS));

        let crop = capture_screen_region(&self.sender_name_region)?;
        Ok(self.run_tesseract(&preprocess_for_ocr(&crop)))
    }

    fn click(&mut self, target: Point) -> Result<()> {
        self.enigo
            .move_mouse(target.x, target.y, Coordinate::Abs)
            .map_err(|e| anyhow::anyhow!("Mouse move failed: {}", e))?;
        self.enigo
            .button(Button::Left, Direction::Click)
            .map_err(|e| anyhow::anyhow!("Click failed: {}", e))?;
        debug!("Clicked ({}, {})", target.x, target.y);
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> Result<()> {
        self.enigo
            .text(text)
            .map_err(|e| anyhow::anyhow!("Text entry failed: {}", e))
    }

    fn press_escape(&mut self) -> Result<()> {
        self.enigo
            .key(Key::Escape, Direction::Click)
            .map_err(|e| anyhow::anyhow!("Escape press failed: {}", e))
    }

    fn press_enter(&mut self) -> Result<()> {
        self.enigo
            .key(Key::Return, Direction::Click)
            .map_err(|e| anyhow::anyhow!("Enter press failed: {}", e))
    }
}

/// Prepare a bubble crop for OCR: grayscale, then threshold so the dark
/// message text becomes black on a white background.
fn preprocess_for_ocr(image: &RgbaImage) -> GrayImage {
    let gray = image::imageops::grayscale(image);
    let (w, h) = gray.dimensions();

    GrayImage::from_fn(w, h, |x, y| {
        let pixel = gray.get_pixel(x, y)[0];
        if pixel < 110 {
            image::Luma([0u8])
        } else {
            image::Luma([255u8])
        }
    })
}

fn check_tesseract() -> bool {
    Command::new("tesseract")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_keeps_dark_text() {
        let img = RgbaImage::from_fn(10, 10, |x, _| {
            if x < 5 {
                image::Rgba([40, 40, 40, 255])
            } else {
                image::Rgba([230, 230, 230, 255])
            }
        });
        let processed = preprocess_for_ocr(&img);
        assert_eq!(processed.get_pixel(0, 0)[0], 0);
        assert_eq!(processed.get_pixel(9, 0)[0], 255);
    }
}
