pub mod bridge;
pub mod config;
pub mod engine;
pub mod events;
pub mod input;

pub use bridge::{CommandBridge, LoggingReasoner, Reasoner};
pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle, FrameSource, UiActor};
pub use events::{ControlCommand, TriggerEvent};
