use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_TITLE: &str = "New Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of a structured payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    /// A data URL or remote reference to the image bytes.
    Image { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_name: String,
    pub file_type: String,
}

/// Message content. The variant is chosen when the message is built and is
/// stored with its tag, so readers never have to guess the shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Structured {
        parts: Vec<Part>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<FileMeta>,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    pub fn has_image(&self) -> bool {
        match self {
            Content::Text { .. } => false,
            Content::Structured { parts, .. } => {
                parts.iter().any(|p| matches!(p, Part::Image { .. }))
            }
        }
    }

    pub fn file(&self) -> Option<&FileMeta> {
        match self {
            Content::Text { .. } => None,
            Content::Structured { file, .. } => file.as_ref(),
        }
    }

    /// Text of the last text part, or the whole text for plain content.
    pub fn last_text(&self) -> Option<&str> {
        match self {
            Content::Text { text } => Some(text),
            Content::Structured { parts, .. } => parts.iter().rev().find_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                Part::Image { .. } => None,
            }),
        }
    }

    /// Flattens the content into a single string. Images become a short
    /// placeholder.
    pub fn to_plain_text(&self) -> String {
        match self {
            Content::Text { text } => text.clone(),
            Content::Structured { parts, file } => {
                let mut out: Vec<String> = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        Part::Text { text } => out.push(text.clone()),
                        Part::Image { .. } => {
                            let name = file.as_ref().map(|f| f.file_name.as_str()).unwrap_or("image");
                            out.push(format!("[image: {}]", name));
                        }
                    }
                }
                out.join("\n")
            }
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Content::Text { text } => text.trim().is_empty(),
            Content::Structured { parts, .. } => parts.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: Content,
    pub sender_id: Option<String>,
    pub ai_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A message that has not been stored yet. The constructors are the only way
/// to build one, which keeps sender and persona tags consistent with the role.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    role: Role,
    content: Content,
    sender_id: Option<String>,
    ai_agent: Option<String>,
}

impl NewMessage {
    pub fn user(content: Content, sender_id: Option<String>) -> Self {
        Self {
            role: Role::User,
            content,
            sender_id,
            ai_agent: None,
        }
    }

    pub fn assistant(content: Content, ai_agent: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            sender_id: None,
            ai_agent: Some(ai_agent.into()),
        }
    }

    pub fn system(content: Content) -> Self {
        Self {
            role: Role::System,
            content,
            sender_id: None,
            ai_agent: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn sender_id(&self) -> Option<&str> {
        self.sender_id.as_deref()
    }

    pub fn ai_agent(&self) -> Option<&str> {
        self.ai_agent.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
}
