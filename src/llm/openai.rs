use super::{AssistantSpec, ChatRequest, CompletionService, DispatchError, ProviderMessage, RunStatus};
use crate::chat::{Content, Part};
use crate::composer::Document;
use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize, Debug, PartialEq)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize, Debug, PartialEq)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireReply,
}

#[derive(Deserialize)]
struct WireReply {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Deserialize)]
struct Deleted {
    #[serde(default)]
    deleted: bool,
}

#[derive(Deserialize)]
struct RunObject {
    status: RunStatus,
}

#[derive(Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Deserialize)]
struct ThreadMessage {
    #[serde(default)]
    content: Vec<ThreadContent>,
}

#[derive(Deserialize)]
struct ThreadContent {
    text: Option<ThreadText>,
}

#[derive(Deserialize)]
struct ThreadText {
    value: String,
}

fn to_wire(message: &ProviderMessage) -> WireMessage {
    let content = match &message.content {
        Content::Text { text } => WireContent::Text(text.clone()),
        Content::Structured { parts, .. } => WireContent::Parts(
            parts
                .iter()
                .map(|p| match p {
                    Part::Text { text } => WirePart::Text { text: text.clone() },
                    Part::Image { url } => WirePart::ImageUrl {
                        image_url: ImageUrl { url: url.clone() },
                    },
                })
                .collect(),
        ),
    };
    WireMessage {
        role: message.role.as_str(),
        content,
    }
}

/// OpenAI-compatible REST client covering chat completions and the
/// assistants file-search workflow.
pub struct OpenAiClient {
    config: OpenAiConfig,
    http: Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, DispatchError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        if self.config.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.config.api_key))
        }
    }

    fn beta(&self, req: RequestBuilder) -> RequestBuilder {
        self.authorized(req).header("OpenAI-Beta", "assistants=v2")
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, DispatchError> {
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Api {
                status,
                message: text,
            });
        }

        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| DispatchError::Parse(e.to_string()))
    }
}

#[async_trait]
impl CompletionService for OpenAiClient {
    async fn chat(&self, request: &ChatRequest) -> Result<String, DispatchError> {
        let body = WireRequest {
            model: &request.model,
            messages: request.messages.iter().map(to_wire).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let req = self
            .authorized(self.http.post(self.url("/chat/completions")))
            .json(&body);
        let data: WireResponse = self.send(req).await?;

        Ok(data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn upload_file(&self, document: &Document) -> Result<String, DispatchError> {
        let part = multipart::Part::bytes(document.bytes.clone())
            .file_name(document.file_name.clone())
            .mime_str(&document.mime_type)?;
        let form = multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);

        let req = self
            .authorized(self.http.post(self.url("/files")))
            .multipart(form);
        let created: Created = self.send(req).await?;
        debug!(file_id = %created.id, "file uploaded");
        Ok(created.id)
    }

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<String, DispatchError> {
        let req = self.beta(self.http.post(self.url("/assistants"))).json(&json!({
            "name": spec.name,
            "instructions": spec.instructions,
            "model": spec.model,
            "tools": [{ "type": "file_search" }],
        }));
        let created: Created = self.send(req).await?;
        Ok(created.id)
    }

    async fn create_thread(&self) -> Result<String, DispatchError> {
        let req = self
            .beta(self.http.post(self.url("/threads")))
            .json(&json!({}));
        let created: Created = self.send(req).await?;
        Ok(created.id)
    }

    async fn add_thread_message(
        &self,
        thread_id: &str,
        text: &str,
        file_id: &str,
    ) -> Result<(), DispatchError> {
        let req = self
            .beta(
                self.http
                    .post(self.url(&format!("/threads/{}/messages", thread_id))),
            )
            .json(&json!({
                "role": "user",
                "content": text,
                "attachments": [
                    { "file_id": file_id, "tools": [{ "type": "file_search" }] }
                ],
            }));
        let _: Created = self.send(req).await?;
        Ok(())
    }

    async fn create_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
    ) -> Result<String, DispatchError> {
        let req = self
            .beta(self.http.post(self.url(&format!("/threads/{}/runs", thread_id))))
            .json(&json!({ "assistant_id": assistant_id }));
        let created: Created = self.send(req).await?;
        Ok(created.id)
    }

    async fn run_status(&self, thread_id: &str, run_id: &str) -> Result<RunStatus, DispatchError> {
        let req = self.beta(
            self.http
                .get(self.url(&format!("/threads/{}/runs/{}", thread_id, run_id))),
        );
        let run: RunObject = self.send(req).await?;
        Ok(run.status)
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), DispatchError> {
        let req = self.beta(
            self.http
                .post(self.url(&format!("/threads/{}/runs/{}/cancel", thread_id, run_id))),
        );
        let _: RunObject = self.send(req).await?;
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), DispatchError> {
        let req = self.authorized(self.http.delete(self.url(&format!("/files/{}", file_id))));
        let result: Deleted = self.send(req).await?;
        if !result.deleted {
            debug!(file_id, "provider kept the file after delete");
        }
        Ok(())
    }

    async fn latest_message_text(&self, thread_id: &str) -> Result<Option<String>, DispatchError> {
        let req = self
            .beta(
                self.http
                    .get(self.url(&format!("/threads/{}/messages", thread_id))),
            )
            .query(&[("order", "desc"), ("limit", "1")]);
        let list: MessageList = self.send(req).await?;

        Ok(list
            .data
            .into_iter()
            .next()
            .and_then(|m| m.content.into_iter().find_map(|c| c.text))
            .map(|t| t.value))
    }
}
