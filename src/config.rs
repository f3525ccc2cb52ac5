//! Engine configuration. Every detection threshold, screen rectangle, and
//! store path lives here as a named field; nothing is a scattered literal.

use anyhow::{Context, Result};
use bubble_capture::{Point, Rect, SafeRegionConfig};
use bubble_vision::{anchors, AnchorSpec, LocatorConfig, SkinSpec};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay between polling cycles.
    pub poll_interval_ms: u64,
    /// Absolute screen rectangle of the chat column.
    pub chat_region: Rect,
    /// Pixels the bubble capture is extended leftward to include the avatar.
    pub avatar_extension: u32,
    /// X offset from a bubble's left edge to its sender avatar.
    pub avatar_offset_x: i32,
    /// Directory holding the template images.
    pub assets_dir: PathBuf,
    /// Every template anchor with its skin variants.
    pub anchors: Vec<AnchorSpec>,
    /// Anchor that must match inside a bubble before text extraction; `None`
    /// (or an anchor with no loadable skins) disables the gate.
    pub keyword_anchor: Option<String>,
    pub color_profiles_path: PathBuf,
    pub message_store_path: PathBuf,
    pub bubble_store_path: PathBuf,
    pub locator: LocatorConfig,
    /// Seconds a remembered message counts as duplicate.
    pub text_expiry_secs: u64,
    pub text_similarity: f64,
    pub image_capacity: usize,
    pub image_max_distance: u32,
    pub safe_region: SafeRegionConfig,
    /// Threshold for navigation-marker matching, looser than bubble matching
    /// because state markers are large and unambiguous.
    pub state_confidence: f64,
    /// Absolute rectangle the sender name is read from on the profile page.
    pub sender_name_region: Rect,
    /// Where to click for the chat input when its template is not found.
    pub chat_input_fallback: Point,
    /// Escape presses allowed while navigating back to the chat room.
    pub escape_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            chat_region: Rect::new(100, 150, 520, 780),
            avatar_extension: 50,
            avatar_offset_x: -50,
            assets_dir: PathBuf::from("assets/templates"),
            anchors: default_anchors(),
            keyword_anchor: Some("keyword".to_string()),
            color_profiles_path: PathBuf::from("assets/color_profiles.json"),
            message_store_path: PathBuf::from("state/messages.json"),
            bubble_store_path: PathBuf::from("state/bubbles.json"),
            locator: LocatorConfig::default(),
            text_expiry_secs: 3600,
            text_similarity: 0.95,
            image_capacity: 5,
            image_max_distance: 5,
            safe_region: SafeRegionConfig::default(),
            state_confidence: 0.7,
            sender_name_region: Rect::new(220, 160, 260, 40),
            chat_input_fallback: Point::new(300, 1000),
            escape_max_attempts: 4,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; fields missing from the file take their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Load the config file, falling back to defaults when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let config = Self::load(path)?;
            info!("Config loaded from {}", path.display());
            Ok(config)
        } else {
            info!(
                "No config at {}, using built-in defaults",
                path.display()
            );
            Ok(Self::default())
        }
    }
}

fn skin(id: &str, file: &str) -> SkinSpec {
    SkinSpec {
        id: id.to_string(),
        file: file.to_string(),
    }
}

fn single(name: &str, file: &str) -> AnchorSpec {
    AnchorSpec {
        name: name.to_string(),
        skins: vec![skin("default", file)],
    }
}

fn default_anchors() -> Vec<AnchorSpec> {
    vec![
        AnchorSpec {
            name: anchors::CORNER_TL.to_string(),
            skins: vec![
                skin("default", "corner_tl.png"),
                skin("wolf", "corner_tl_wolf.png"),
            ],
        },
        AnchorSpec {
            name: anchors::CORNER_BR.to_string(),
            skins: vec![
                skin("default", "corner_br.png"),
                skin("wolf", "corner_br_wolf.png"),
            ],
        },
        single(anchors::BOT_CORNER_TL, "bot_corner_tl.png"),
        single(anchors::BOT_CORNER_BR, "bot_corner_br.png"),
        AnchorSpec {
            name: "keyword".to_string(),
            skins: vec![
                skin("lower", "keyword_lower.png"),
                skin("upper", "keyword_upper.png"),
            ],
        },
        single("chat_input", "chat_input.png"),
        single("send_button", "send_button.png"),
        single("chat_room", "chat_room.png"),
        single("profile_page", "profile_page.png"),
        single("profile_name_page", "profile_name_page.png"),
        single("president_title", "president_title.png"),
        single("position_development", "position_development.png"),
        single("position_interior", "position_interior.png"),
        single("position_science", "position_science.png"),
        single("position_security", "position_security.png"),
        single("position_strategy", "position_strategy.png"),
    ]
}
