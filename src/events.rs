//! Wire contracts between the polling engine and the reasoning side.
//!
//! Regions travel as `[x, y, w, h]` arrays and snapshots as PNG bytes, so
//! both ends of the bridge can serialize events without sharing image types.

use serde::{Deserialize, Serialize};

/// One confirmed-new chat message, handed from the polling engine to the
/// command bridge. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub sender: String,
    pub text: String,
    /// Absolute screen rectangle of the bubble, `[x, y, w, h]`.
    pub bubble_region: [i32; 4],
    /// PNG-encoded bubble capture (extended to include the avatar), when
    /// encoding succeeded.
    pub bubble_snapshot: Option<Vec<u8>>,
    /// Absolute rectangle the snapshot can later be re-located within.
    pub search_area: Option<[i32; 4]>,
}

/// A command from the reasoning side back to the polling engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    Pause,
    Resume,
    ClearHistory,
    SendReply {
        text: String,
    },
    RemovePosition {
        trigger_bubble_region: [i32; 4],
        bubble_snapshot: Option<Vec<u8>>,
        search_area: Option<[i32; 4]>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_action_tags() {
        assert_eq!(
            serde_json::to_value(ControlCommand::Pause).unwrap(),
            json!({"action": "pause"})
        );
        assert_eq!(
            serde_json::to_value(ControlCommand::ClearHistory).unwrap(),
            json!({"action": "clear_history"})
        );
        let reply: ControlCommand =
            serde_json::from_value(json!({"action": "send_reply", "text": "hi"})).unwrap();
        assert_eq!(
            reply,
            ControlCommand::SendReply {
                text: "hi".to_string()
            }
        );
    }

    #[test]
    fn test_trigger_event_round_trip() {
        let event = TriggerEvent {
            sender: "Alice".to_string(),
            text: "hello".to_string(),
            bubble_region: [200, 300, 120, 48],
            bubble_snapshot: None,
            search_area: Some([50, 100, 450, 600]),
        };
        let back: TriggerEvent =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(back.sender, "Alice");
        assert_eq!(back.bubble_region, [200, 300, 120, 48]);
        assert_eq!(back.search_area, Some([50, 100, 450, 600]));
    }
}
