//! The polling engine: one dedicated thread that turns screen captures into
//! trigger events and executes commands coming back from the bridge.
//!
//! Screen capture and synthetic input are blocking OS calls, so the whole
//! loop lives on a `std::thread` and talks to the async side exclusively
//! through the two unbounded queues. Commands are drained at the top of each
//! cycle; a pause stops new cycles from starting but never cancels work
//! already in flight.

use anyhow::{Context, Result};
use image::RgbaImage;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use bubble_capture::{crop_rect, Compensator, Point, Rect};
use bubble_dedup::{BubbleImageDeduplicator, MessageDeduplicator};
use bubble_vision::{
    best_match, BubbleLocator, BubbleRegion, ColorProfiles, Marker, NavigationDetector,
    SenderKind, TemplateMatcher,
};

use crate::config::EngineConfig;
use crate::events::{ControlCommand, TriggerEvent};

/// Settle time after a navigation key press or click before re-capturing.
const INPUT_SETTLE_MS: u64 = 150;

/// Source of frames for a given absolute screen rectangle. The live
/// implementation captures the primary monitor; tests feed synthetic frames.
pub trait FrameSource: Send {
    fn capture(&mut self, region: &Rect) -> Result<RgbaImage>;
}

/// Synthetic input plus the two extraction paths that need it. Everything
/// here blocks, so it is only ever called from the engine thread.
pub trait UiActor: Send {
    /// Read the message text out of a cropped bubble bitmap.
    fn extract_text(&mut self, bubble: &RgbaImage) -> Result<Option<String>>;
    /// Open the profile behind an avatar point and read the sender name.
    /// The engine navigates back to the chat room afterwards.
    fn extract_sender(&mut self, avatar: Point) -> Result<Option<String>>;
    fn click(&mut self, target: Point) -> Result<()>;
    fn type_text(&mut self, text: &str) -> Result<()>;
    fn press_escape(&mut self) -> Result<()>;
    fn press_enter(&mut self) -> Result<()>;
}

/// Handle to a running engine thread.
pub struct EngineHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    pub commands: UnboundedSender<ControlCommand>,
    triggers: Option<UnboundedReceiver<TriggerEvent>>,
}

impl EngineHandle {
    /// The trigger queue endpoint, taken once by the consumer.
    pub fn take_triggers(&mut self) -> Option<UnboundedReceiver<TriggerEvent>> {
        self.triggers.take()
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        info!("Engine stopped");
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub struct Engine<F, U> {
    config: EngineConfig,
    frames: F,
    ui: U,
    matcher: Arc<TemplateMatcher>,
    locator: BubbleLocator,
    nav: NavigationDetector,
    compensator: Compensator,
    text_dedup: MessageDeduplicator,
    image_dedup: BubbleImageDeduplicator,
    trigger_tx: UnboundedSender<TriggerEvent>,
    command_rx: UnboundedReceiver<ControlCommand>,
    stop: Arc<AtomicBool>,
    paused: bool,
}

impl<F: FrameSource + 'static, U: UiActor + 'static> Engine<F, U> {
    /// Spawn the polling thread and hand back the queue endpoints.
    pub fn start(config: EngineConfig, frames: F, ui: U) -> EngineHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let engine = Self::new(config, frames, ui, trigger_tx, command_rx, stop.clone());
        let join = thread::Builder::new()
            .name("bubble-engine".to_string())
            .spawn(move || engine.run());

        let join = match join {
            Ok(join) => Some(join),
            Err(e) => {
                warn!("Failed to spawn engine thread: {}", e);
                None
            }
        };

        EngineHandle {
            stop,
            join,
            commands: command_tx,
            triggers: Some(trigger_rx),
        }
    }

    fn new(
        config: EngineConfig,
        frames: F,
        ui: U,
        trigger_tx: UnboundedSender<TriggerEvent>,
        command_rx: UnboundedReceiver<ControlCommand>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let matcher = Arc::new(TemplateMatcher::load(&config.assets_dir, &config.anchors));
        let profiles = ColorProfiles::load(&config.color_profiles_path);
        let locator = BubbleLocator::new(matcher.clone(), profiles, config.locator.clone());
        let nav = NavigationDetector::new(matcher.clone(), config.state_confidence);
        let compensator = Compensator::new(&config.safe_region);
        let text_dedup = MessageDeduplicator::new(
            config.message_store_path.clone(),
            config.text_expiry_secs,
            config.text_similarity,
        );
        let image_dedup = BubbleImageDeduplicator::new(
            config.bubble_store_path.clone(),
            config.image_capacity,
            config.image_max_distance,
        );

        Self {
            config,
            frames,
            ui,
            matcher,
            locator,
            nav,
            compensator,
            text_dedup,
            image_dedup,
            trigger_tx,
            command_rx,
            stop,
            paused: false,
        }
    }

    fn run(mut self) {
        info!(
            "Engine polling every {}ms over {:?}",
            self.config.poll_interval_ms, self.config.chat_region
        );
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        while !self.stop.load(Ordering::Relaxed) {
            self.poll_once();
            thread::sleep(interval);
        }
    }

    /// One scheduling step: execute pending commands, then, unless paused,
    /// run a detection cycle. Nothing in here may kill the thread.
    fn poll_once(&mut self) {
        self.drain_commands();
        if self.paused {
            return;
        }
        if let Err(e) = self.cycle() {
            warn!("Poll cycle failed: {:#}", e);
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                ControlCommand::Pause => {
                    if !self.paused {
                        info!("Polling paused");
                    }
                    self.paused = true;
                }
                ControlCommand::Resume => {
                    if self.paused {
                        info!("Polling resumed");
                    }
                    self.paused = false;
                }
                ControlCommand::ClearHistory => {
                    if let Err(e) = self.text_dedup.clear() {
                        warn!("Failed to clear message history: {:#}", e);
                    }
                    if let Err(e) = self.image_dedup.clear() {
                        warn!("Failed to clear bubble hashes: {:#}", e);
                    }
                    info!("Dedup stores cleared");
                }
                ControlCommand::SendReply { text } => {
                    if let Err(e) = self.send_reply(&text) {
                        warn!("Failed to send reply: {:#}", e);
                    }
                }
                ControlCommand::RemovePosition {
                    trigger_bubble_region,
                    bubble_snapshot,
                    search_area,
                } => {
                    if let Err(e) = self.remove_position(
                        Rect::from_array(trigger_bubble_region),
                        bubble_snapshot.as_deref(),
                        search_area.map(Rect::from_array),
                    ) {
                        warn!("Failed to remove position: {:#}", e);
                    }
                }
            }
        }
    }

    /// One capture → locate → dedup → extract → trigger pass.
    fn cycle(&mut self) -> Result<()> {
        let capture_region = self.config.chat_region.extend_left(self.config.avatar_extension);
        let frame = self.frames.capture(&capture_region)?;

        let Some(bubble) = self.target_bubble(&frame) else {
            return Ok(());
        };

        let abs_rect = to_absolute(&bubble.rect, &capture_region);
        let snapshot = crop_rect(&frame, &bubble.rect.extend_left(self.config.avatar_extension));
        let bubble_id = format!(
            "bubble_{}_{}_{}_{}",
            abs_rect.left, abs_rect.top, abs_rect.width, abs_rect.height
        );
        // The sender is not known until the profile read later in the cycle.
        if self.image_dedup.is_duplicate(&bubble_id, "", &snapshot) {
            debug!("Bubble {} still on screen, skipping", bubble_id);
            return Ok(());
        }

        let bubble_crop = crop_rect(&frame, &bubble.rect);
        if !self.keyword_present(&bubble_crop) {
            debug!("Bubble {} has no keyword, skipping", bubble_id);
            return Ok(());
        }

        let Some(text) = self.ui.extract_text(&bubble_crop)? else {
            debug!("No text read from bubble {}", bubble_id);
            return Ok(());
        };

        let avatar = Point::new(
            abs_rect.left + self.config.avatar_offset_x,
            abs_rect.center().y,
        );
        if !self.compensator.validate_point(avatar) {
            return Ok(());
        }
        // The avatar is clicked inside the read, so the walk back to the
        // chat room runs even when the read fails.
        let sender = self.ui.extract_sender(avatar);
        let cleanup = self.escape_to_chat();
        let sender = sender?;
        cleanup?;
        let Some(sender) = sender else {
            debug!("Sender name unreadable for bubble {}", bubble_id);
            return Ok(());
        };

        if self.text_dedup.is_duplicate(&sender, &text) {
            debug!("Message from {} already handled", sender);
            return Ok(());
        }

        info!("New message from {}: {}", sender, text);
        let event = TriggerEvent {
            sender,
            text,
            bubble_region: abs_rect.to_array(),
            bubble_snapshot: encode_png(&snapshot),
            search_area: Some(capture_region.to_array()),
        };
        if self.trigger_tx.send(event).is_err() {
            warn!("Trigger queue closed, event dropped");
        }
        Ok(())
    }

    /// The lowest bubble on screen not sent by the player; newest messages
    /// render at the bottom of the chat column.
    fn target_bubble(&self, frame: &RgbaImage) -> Option<BubbleRegion> {
        self.locator
            .locate(frame)
            .into_iter()
            .filter(|b| b.sender == SenderKind::Other)
            .max_by_key(|b| b.rect.bottom())
    }

    fn keyword_present(&self, bubble_crop: &RgbaImage) -> bool {
        let Some(anchor) = self.config.keyword_anchor.as_deref() else {
            return true;
        };
        if !self.matcher.has_anchor(anchor) {
            // No keyword assets loaded, gate disabled.
            return true;
        }
        let gray = image::imageops::grayscale(bubble_crop);
        !self
            .matcher
            .find(&gray, anchor, self.config.locator.confidence)
            .is_empty()
    }

    /// Press Escape until the chat-room marker is visible again, giving up
    /// after a bounded number of attempts.
    fn escape_to_chat(&mut self) -> Result<()> {
        for attempt in 0..self.config.escape_max_attempts {
            let frame = self.frames.capture(&self.config.chat_region)?;
            if self.nav.is_visible(&frame, Marker::ChatRoom) {
                return Ok(());
            }
            let blocking = self.nav.detect(
                &frame,
                &[Marker::ProfileDetail, Marker::ProfileCard, Marker::CapitolTitle],
            );
            debug!(
                "Not in chat room (attempt {}, markers {:?}), pressing Escape",
                attempt + 1,
                blocking.iter().map(|h| h.marker).collect::<Vec<_>>()
            );
            self.ui.press_escape()?;
            thread::sleep(Duration::from_millis(INPUT_SETTLE_MS));
        }
        warn!(
            "Chat room not reached after {} Escape presses",
            self.config.escape_max_attempts
        );
        Ok(())
    }

    /// Type a reply into the chat input and send it. The input and send
    /// button are template-located; each falls back (configured coordinates,
    /// Enter key) when its template is not found.
    fn send_reply(&mut self, text: &str) -> Result<()> {
        let frame = self.frames.capture(&self.config.chat_region)?;
        let gray = image::imageops::grayscale(&frame);

        let input_point = self
            .best_anchor_point(&gray, "chat_input")
            .unwrap_or(self.config.chat_input_fallback);
        if !self.compensator.validate_point(input_point) {
            anyhow::bail!("Chat input target outside safe region");
        }
        self.ui.click(input_point)?;
        thread::sleep(Duration::from_millis(INPUT_SETTLE_MS));
        self.ui.type_text(text)?;

        match self.best_anchor_point(&gray, "send_button") {
            Some(send_point) if self.compensator.validate_point(send_point) => {
                self.ui.click(send_point)?;
            }
            _ => self.ui.press_enter()?,
        }
        info!("Reply sent ({} chars)", text.chars().count());
        Ok(())
    }

    /// Best hit of a single anchor, as an absolute screen point at its
    /// center.
    fn best_anchor_point(&self, gray: &image::GrayImage, anchor: &str) -> Option<Point> {
        self.matcher
            .find(gray, anchor, self.config.locator.confidence)
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map(|hit| {
                let abs = to_absolute(&hit.rect, &self.config.chat_region);
                abs.center()
            })
    }

    /// Re-locate a previously triggered bubble via its snapshot and walk the
    /// capitol pages to remove the position behind it. Degrades to a logged
    /// no-op when the snapshot, the match, or the markers are absent.
    fn remove_position(
        &mut self,
        bubble_region: Rect,
        snapshot: Option<&[u8]>,
        search_area: Option<Rect>,
    ) -> Result<()> {
        let search_area = search_area.unwrap_or(self.config.chat_region);
        let target = match self.relocate_bubble(snapshot, &search_area)? {
            Some(rect) => rect,
            None => {
                debug!("Snapshot not re-located, using recorded region");
                bubble_region
            }
        };

        let click = Point::new(
            target.left + self.config.avatar_offset_x,
            target.center().y,
        );
        if !self.compensator.validate_point(click) {
            anyhow::bail!("Position target outside safe region");
        }
        self.ui.click(click)?;
        thread::sleep(Duration::from_millis(INPUT_SETTLE_MS));

        // Past the avatar click the screen state is unknown; the walk back
        // to the chat room runs no matter how the page walk went.
        let walked = self.click_position_button();
        let cleanup = self.escape_to_chat();
        walked?;
        cleanup
    }

    /// On the capitol page, click the strongest position button. A missing
    /// page or button is a logged no-op.
    fn click_position_button(&mut self) -> Result<()> {
        let frame = self.frames.capture(&self.config.chat_region)?;
        if !self.nav.is_visible(&frame, Marker::CapitolTitle) {
            warn!("Capitol page did not open, aborting position removal");
            return Ok(());
        }

        let positions = self.nav.detect(&frame, &Marker::POSITIONS);
        let Some(button) = positions
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        else {
            warn!("No position buttons visible, aborting position removal");
            return Ok(());
        };

        let button_point = to_absolute(&button.rect, &self.config.chat_region).center();
        if self.compensator.validate_point(button_point) {
            info!("Removing position via {:?}", button.marker);
            self.ui.click(button_point)?;
            thread::sleep(Duration::from_millis(INPUT_SETTLE_MS));
        }
        Ok(())
    }

    /// Find the recorded bubble snapshot inside the live search area.
    /// Returns the absolute rectangle of the best match above the locator
    /// threshold.
    fn relocate_bubble(
        &mut self,
        snapshot: Option<&[u8]>,
        search_area: &Rect,
    ) -> Result<Option<Rect>> {
        let Some(bytes) = snapshot else {
            return Ok(None);
        };
        let template = image::load_from_memory(bytes)
            .context("Failed to decode bubble snapshot")?
            .to_luma8();
        let frame = self.frames.capture(search_area)?;
        let gray = image::imageops::grayscale(&frame);

        let Some(hit) = best_match(&gray, &template) else {
            return Ok(None);
        };
        if hit.confidence < self.config.locator.confidence {
            debug!("Snapshot match too weak ({:.2})", hit.confidence);
            return Ok(None);
        }
        Ok(Some(to_absolute(&hit.rect, search_area)))
    }
}

/// Translate a frame-local rectangle to absolute screen coordinates given
/// the captured region.
fn to_absolute(local: &Rect, captured: &Rect) -> Rect {
    Rect::new(
        captured.left + local.left,
        captured.top + local.top,
        local.width,
        local.height,
    )
}

fn encode_png(image: &RgbaImage) -> Option<Vec<u8>> {
    let mut bytes = Vec::new();
    match image.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png) {
        Ok(()) => Some(bytes),
        Err(e) => {
            warn!("Failed to encode bubble snapshot: {}", e);
            None
        }
    }
}
