use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use bubblebot::bridge::{CommandBridge, LoggingReasoner};
use bubblebot::config::EngineConfig;
use bubblebot::engine::Engine;
use bubblebot::input::{LiveFrameSource, LiveUiActor};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "bubblebot=debug,bubble_capture=debug,bubble_vision=debug,bubble_dedup=debug"
                    .into()
            }),
        )
        .init();

    let config_path = std::env::var("BUBBLEBOT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("bubblebot.json"));
    let config = EngineConfig::load_or_default(&config_path)?;

    if let Some(parent) = config.message_store_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let ui = LiveUiActor::new(config.sender_name_region)?;
    let mut engine = Engine::start(config, LiveFrameSource, ui);
    let triggers = engine
        .take_triggers()
        .context("Trigger queue already taken")?;
    let bridge = CommandBridge::new(LoggingReasoner, triggers, engine.commands.clone());

    tokio::select! {
        _ = bridge.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }
    engine.stop();
    Ok(())
}
