use super::{AssistantSpec, ChatRequest, CompletionService, DispatchError, RunStatus};
use crate::composer::Document;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct Recorded {
    chat_requests: Vec<ChatRequest>,
    uploads: Vec<String>,
    files_deleted: Vec<String>,
    thread_messages: Vec<String>,
    status_polls: usize,
    assistants_created: usize,
    runs_cancelled: usize,
    failing_creations: usize,
    statuses: VecDeque<RunStatus>,
}

/// In-process completion service with canned answers that records every call.
pub struct ScriptedCompletions {
    reply: Result<String, (u16, String)>,
    latest_message: Option<String>,
    delay: Option<Duration>,
    recorded: Mutex<Recorded>,
}

impl ScriptedCompletions {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            latest_message: None,
            delay: None,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    pub fn failing(status: u16, message: &str) -> Self {
        Self {
            reply: Err((status, message.to_string())),
            ..Self::replying("")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_run_statuses(self, statuses: Vec<RunStatus>) -> Self {
        self.recorded().statuses = statuses.into();
        self
    }

    pub fn with_latest_message(mut self, text: Option<&str>) -> Self {
        self.latest_message = text.map(str::to_string);
        self
    }

    pub fn with_failing_assistant_creations(self, n: usize) -> Self {
        self.recorded().failing_creations = n;
        self
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.recorded().chat_requests.clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.recorded().uploads.clone()
    }

    pub fn files_deleted(&self) -> Vec<String> {
        self.recorded().files_deleted.clone()
    }

    pub fn thread_messages(&self) -> Vec<String> {
        self.recorded().thread_messages.clone()
    }

    pub fn status_polls(&self) -> usize {
        self.recorded().status_polls
    }

    pub fn assistants_created(&self) -> usize {
        self.recorded().assistants_created
    }

    pub fn runs_cancelled(&self) -> usize {
        self.recorded().runs_cancelled
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletions {
    async fn chat(&self, request: &ChatRequest) -> Result<String, DispatchError> {
        self.recorded().chat_requests.push(request.clone());
        self.pause().await;
        match &self.reply {
            Ok(text) => Ok(text.clone()),
            Err((status, message)) => Err(DispatchError::Api {
                status: *status,
                message: message.clone(),
            }),
        }
    }

    async fn upload_file(&self, document: &Document) -> Result<String, DispatchError> {
        let mut rec = self.recorded();
        rec.uploads.push(document.file_name.clone());
        Ok(format!("file-{}", rec.uploads.len()))
    }

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<String, DispatchError> {
        self.pause().await;
        let mut rec = self.recorded();
        if rec.failing_creations > 0 {
            rec.failing_creations -= 1;
            return Err(DispatchError::Api {
                status: 500,
                message: "assistant creation failed".into(),
            });
        }
        rec.assistants_created += 1;
        Ok(format!("asst-{}-{}", spec.name.len(), rec.assistants_created))
    }

    async fn create_thread(&self) -> Result<String, DispatchError> {
        Ok("thread-1".to_string())
    }

    async fn add_thread_message(
        &self,
        _thread_id: &str,
        text: &str,
        _file_id: &str,
    ) -> Result<(), DispatchError> {
        self.recorded().thread_messages.push(text.to_string());
        Ok(())
    }

    async fn create_run(
        &self,
        _thread_id: &str,
        _assistant_id: &str,
    ) -> Result<String, DispatchError> {
        Ok("run-1".to_string())
    }

    async fn run_status(&self, _thread_id: &str, _run_id: &str) -> Result<RunStatus, DispatchError> {
        let mut rec = self.recorded();
        rec.status_polls += 1;
        Ok(rec.statuses.pop_front().unwrap_or(RunStatus::Completed))
    }

    async fn cancel_run(&self, _thread_id: &str, _run_id: &str) -> Result<(), DispatchError> {
        self.recorded().runs_cancelled += 1;
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), DispatchError> {
        self.recorded().files_deleted.push(file_id.to_string());
        Ok(())
    }

    async fn latest_message_text(&self, _thread_id: &str) -> Result<Option<String>, DispatchError> {
        Ok(self.latest_message.clone())
    }
}
