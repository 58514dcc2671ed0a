use crate::chat::Conversation;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// The owner's conversation list changed
    ConversationsChanged {
        owner_id: String,
        conversations: Vec<Conversation>,
    },

    /// A conversation moved between turn states
    TurnState {
        owner_id: String,
        chat_id: String,
        state: TurnState,
    },

    /// A user-visible notification (e.g. a failed send)
    Notification {
        owner_id: String,
        level: NotificationLevel,
        message: String,
    },
}

impl Event {
    pub fn owner_id(&self) -> &str {
        match self {
            Event::ConversationsChanged { owner_id, .. }
            | Event::TurnState { owner_id, .. }
            | Event::Notification { owner_id, .. } => owner_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    AwaitingReply,
    ErrorSurfaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
