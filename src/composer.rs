//! Turns what the user typed (and possibly attached) into message content.
//!
//! Everything here is a pure transform: no storage, no network, no errors.
//! Input that cannot be made sense of is sent on as plain text.

use crate::chat::{Content, FileMeta, Message, Part};
use crate::llm::ProviderMessage;
use base64::{engine::general_purpose::STANDARD, Engine as _};

pub const DOCUMENT_PROMPT: &str = "Please analyze this file.";

const FALLBACK_MIME: &str = "application/octet-stream";

/// A file picked by the user, as received from the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Raw document bytes kept alongside a composed turn for the document
/// analysis path. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Draft {
    Text(String),
    WithAttachment { text: String, attachment: Attachment },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComposedTurn {
    pub content: Content,
    pub document: Option<Document>,
}

impl ComposedTurn {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            content: Content::text(text),
            document: None,
        }
    }
}

pub fn compose(draft: Draft) -> ComposedTurn {
    match draft {
        Draft::Text(text) => ComposedTurn::plain(text),
        Draft::WithAttachment { text, attachment } => compose_attachment(text, attachment),
    }
}

fn compose_attachment(text: String, attachment: Attachment) -> ComposedTurn {
    let file_name = attachment.file_name.trim().to_string();
    if file_name.is_empty() || attachment.bytes.is_empty() {
        return ComposedTurn::plain(text);
    }

    let mime = mime_for(&file_name, attachment.mime_type.as_deref());
    let typed = text.trim();

    if mime.starts_with("image/") {
        let url = format!("data:{};base64,{}", mime, STANDARD.encode(&attachment.bytes));
        let mut parts = vec![Part::Image { url }];
        if !typed.is_empty() {
            parts.push(Part::Text {
                text: typed.to_string(),
            });
        }
        return ComposedTurn {
            content: Content::Structured {
                parts,
                file: Some(FileMeta {
                    file_name,
                    file_type: "image".to_string(),
                }),
            },
            document: None,
        };
    }

    let prompt = if typed.is_empty() { DOCUMENT_PROMPT } else { typed };
    ComposedTurn {
        content: Content::Structured {
            parts: vec![
                Part::Text {
                    text: format!("Analyzing file: {}", file_name),
                },
                Part::Text {
                    text: prompt.to_string(),
                },
            ],
            file: Some(FileMeta {
                file_name: file_name.clone(),
                file_type: mime.clone(),
            }),
        },
        document: Some(Document {
            file_name,
            mime_type: mime,
            bytes: attachment.bytes,
        }),
    }
}

fn mime_for(file_name: &str, declared: Option<&str>) -> String {
    match declared.map(str::trim).filter(|m| !m.is_empty()) {
        Some(m) => m.to_ascii_lowercase(),
        None => mime_guess::from_path(file_name)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| FALLBACK_MIME.to_string()),
    }
}

/// Stored messages in the provider-agnostic shape, oldest first.
pub fn to_history(messages: &[Message]) -> Vec<ProviderMessage> {
    messages
        .iter()
        .map(|m| ProviderMessage {
            role: m.role,
            content: m.content.clone(),
        })
        .collect()
}
