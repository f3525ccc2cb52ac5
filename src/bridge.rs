//! The command bridge: async consumer of trigger events.
//!
//! For every trigger the bridge pauses the engine, asks the reasoner for
//! commands, forwards them, and resumes polling. A pause issued by the
//! reasoner itself (on the user's behalf) sticks: the bridge never resumes
//! over it.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::events::{ControlCommand, TriggerEvent};

/// Seam to the external reasoning component.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn respond(&self, trigger: &TriggerEvent) -> Result<Vec<ControlCommand>>;
}

/// Placeholder reasoner that logs triggers and issues no commands. Stands in
/// until a real reasoning client is wired up.
pub struct LoggingReasoner;

#[async_trait]
impl Reasoner for LoggingReasoner {
    async fn respond(&self, trigger: &TriggerEvent) -> Result<Vec<ControlCommand>> {
        info!(
            "Trigger from {} ({} chars), no reasoner configured",
            trigger.sender,
            trigger.text.chars().count()
        );
        Ok(Vec::new())
    }
}

pub struct CommandBridge<R> {
    reasoner: R,
    triggers: UnboundedReceiver<TriggerEvent>,
    commands: UnboundedSender<ControlCommand>,
    user_paused: bool,
}

impl<R: Reasoner> CommandBridge<R> {
    pub fn new(
        reasoner: R,
        triggers: UnboundedReceiver<TriggerEvent>,
        commands: UnboundedSender<ControlCommand>,
    ) -> Self {
        Self {
            reasoner,
            triggers,
            commands,
            user_paused: false,
        }
    }

    /// Consume triggers until the engine side closes its queue.
    pub async fn run(mut self) {
        while let Some(trigger) = self.triggers.recv().await {
            self.handle(trigger).await;
        }
        info!("Trigger queue closed, bridge exiting");
    }

    async fn handle(&mut self, trigger: TriggerEvent) {
        debug!("Handling trigger from {}", trigger.sender);

        // Hold polling while the reasoner thinks, so the same screen is not
        // re-detected mid-conversation.
        if self.commands.send(ControlCommand::Pause).is_err() {
            warn!("Command queue closed, dropping trigger");
            return;
        }

        match self.reasoner.respond(&trigger).await {
            Ok(commands) => {
                for command in commands {
                    match command {
                        ControlCommand::Pause => self.user_paused = true,
                        ControlCommand::Resume => self.user_paused = false,
                        _ => {}
                    }
                    if self.commands.send(command).is_err() {
                        warn!("Command queue closed, remaining commands dropped");
                        return;
                    }
                }
            }
            Err(e) => warn!("Reasoner failed: {:#}", e),
        }

        // The user's own pause always outlives the implicit one.
        if !self.user_paused && self.commands.send(ControlCommand::Resume).is_err() {
            warn!("Command queue closed, engine left paused");
        }
    }
}
