pub mod assistant;
pub mod openai;
pub mod persona;

#[cfg(test)]
pub mod testing;

use crate::chat::{Content, Role};
use crate::composer::{ComposedTurn, Document};
use assistant::{AssistantProvisioner, PollPolicy};
use async_trait::async_trait;
use persona::Persona;
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const NO_ANALYSIS: &str = "No analysis available";

/// Provider-agnostic message shape.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: Content,
}

impl ProviderMessage {
    pub fn system(prompt: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Content::text(prompt),
        }
    }

    fn flattened(&self) -> Self {
        match &self.content {
            Content::Text { .. } => self.clone(),
            Content::Structured { .. } => Self {
                role: self.role,
                content: Content::text(self.content.to_plain_text()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ProviderMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// Status of an asynchronous document-analysis run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled
                | RunStatus::Failed
                | RunStatus::Completed
                | RunStatus::Incomplete
                | RunStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Expired => "expired",
            RunStatus::Unknown => "unknown",
        }
    }
}

/// Configuration of the long-lived document analysis assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantSpec {
    pub name: String,
    pub instructions: String,
    pub model: String,
}

impl AssistantSpec {
    pub fn file_analysis(model: impl Into<String>) -> Self {
        Self {
            name: "File Analysis Assistant".to_string(),
            instructions: "You are a helpful assistant that can analyze files and answer questions about them.".to_string(),
            model: model.into(),
        }
    }
}

/// The hosted completion API.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<String, DispatchError>;

    /// Uploads a file for use by assistants and returns its id.
    async fn upload_file(&self, document: &Document) -> Result<String, DispatchError>;

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<String, DispatchError>;

    async fn create_thread(&self) -> Result<String, DispatchError>;

    async fn add_thread_message(
        &self,
        thread_id: &str,
        text: &str,
        file_id: &str,
    ) -> Result<(), DispatchError>;

    async fn create_run(&self, thread_id: &str, assistant_id: &str)
        -> Result<String, DispatchError>;

    async fn run_status(&self, thread_id: &str, run_id: &str) -> Result<RunStatus, DispatchError>;

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), DispatchError>;

    async fn delete_file(&self, file_id: &str) -> Result<(), DispatchError>;

    /// Text of the newest message on the thread, if it has any.
    async fn latest_message_text(&self, thread_id: &str) -> Result<Option<String>, DispatchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("run still {last_status} after {attempts} polls ({waited:?})")]
    Timeout {
        attempts: u32,
        waited: Duration,
        last_status: String,
    },
    #[error("request cancelled")]
    Cancelled,
    #[error("run ended with status {0}")]
    RunFailed(String),
    #[error("document attachment is missing its file contents")]
    MissingDocument,
}

/// Which completion path a turn takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Vision,
    Document,
    Text,
}

impl Route {
    /// First match wins: images, then document metadata, then plain text.
    pub fn select(turn: &ComposedTurn) -> Self {
        if turn.content.has_image() {
            Route::Vision
        } else if turn.content.file().is_some() {
            Route::Document
        } else {
            Route::Text
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub text_model: String,
    pub vision_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub poll: PollPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            text_model: "gpt-4-turbo-preview".to_string(),
            vision_model: "gpt-4o".to_string(),
            max_tokens: 500,
            temperature: 0.7,
            poll: PollPolicy::default(),
        }
    }
}

pub struct Dispatcher {
    service: Arc<dyn CompletionService>,
    assistant: Arc<AssistantProvisioner>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        service: Arc<dyn CompletionService>,
        assistant: Arc<AssistantProvisioner>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            service,
            assistant,
            settings,
        }
    }

    /// Produces a reply to `turn` given everything said before it.
    pub async fn complete(
        &self,
        history: &[ProviderMessage],
        turn: &ComposedTurn,
        persona: &Persona,
        cancel: &CancellationToken,
    ) -> Result<String, DispatchError> {
        let route = Route::select(turn);
        info!(?route, persona = %persona.name, history = history.len(), "dispatching turn");

        let system = ProviderMessage::system(&persona.system_prompt);
        let user = ProviderMessage {
            role: Role::User,
            content: turn.content.clone(),
        };

        match route {
            Route::Vision => {
                let request = ChatRequest {
                    model: self.settings.vision_model.clone(),
                    messages: vec![system, user],
                    max_tokens: self.settings.max_tokens,
                    temperature: None,
                };
                self.chat_cancellable(&request, cancel).await
            }
            Route::Document => self.analyze_document(turn, cancel).await,
            Route::Text => {
                let mut messages = Vec::with_capacity(history.len() + 2);
                messages.push(system);
                messages.extend(history.iter().map(ProviderMessage::flattened));
                messages.push(user.flattened());

                let request = ChatRequest {
                    model: self.settings.text_model.clone(),
                    messages,
                    max_tokens: self.settings.max_tokens,
                    temperature: Some(self.settings.temperature),
                };
                self.chat_cancellable(&request, cancel).await
            }
        }
    }

    async fn chat_cancellable(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<String, DispatchError> {
        until_cancelled(cancel, self.service.chat(request)).await
    }

    async fn analyze_document(
        &self,
        turn: &ComposedTurn,
        cancel: &CancellationToken,
    ) -> Result<String, DispatchError> {
        let document = turn
            .document
            .as_ref()
            .ok_or(DispatchError::MissingDocument)?;

        let file_id = until_cancelled(cancel, self.service.upload_file(document)).await?;
        debug!(file_id = %file_id, file_name = %document.file_name, "uploaded document");

        let outcome = self.run_analysis(turn, &file_id, cancel).await;

        // The upload is only needed for this one run.
        if let Err(e) = self.service.delete_file(&file_id).await {
            warn!(file_id = %file_id, "failed to delete uploaded file: {}", e);
        }
        outcome
    }

    async fn run_analysis(
        &self,
        turn: &ComposedTurn,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DispatchError> {
        let prompt = turn
            .content
            .last_text()
            .unwrap_or(crate::composer::DOCUMENT_PROMPT);

        let (thread_id, run_id) = until_cancelled(cancel, async {
            let assistant_id = self.assistant.get_or_create(self.service.as_ref()).await?;
            let thread_id = self.service.create_thread().await?;
            self.service
                .add_thread_message(&thread_id, prompt, file_id)
                .await?;
            let run_id = self.service.create_run(&thread_id, assistant_id).await?;
            Ok::<_, DispatchError>((thread_id, run_id))
        })
        .await?;
        debug!(thread_id = %thread_id, run_id = %run_id, "started analysis run");

        assistant::await_run(
            self.service.as_ref(),
            &thread_id,
            &run_id,
            &self.settings.poll,
            cancel,
        )
        .await?;

        match self.service.latest_message_text(&thread_id).await? {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => {
                warn!(thread_id = %thread_id, "analysis run produced no message");
                Ok(NO_ANALYSIS.to_string())
            }
        }
    }
}

/// Drives `fut` to completion unless `cancel` fires first.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, DispatchError>>,
) -> Result<T, DispatchError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DispatchError::Cancelled),
        res = fut => res,
    }
}
