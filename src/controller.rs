use crate::bus::{Event, EventBus, NotificationLevel, TurnState};
use crate::chat::{Content, Conversation, Message, NewMessage, Role};
use crate::composer::{self, ComposedTurn, Draft};
use crate::entity::Identity;
use crate::error::{ChatError, PersistenceError, ValidationError};
use crate::llm::persona::{Persona, DEFAULT_PERSONA};
use crate::llm::Dispatcher;
use crate::store::ConversationStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What the UI renders: the signed-in owner's conversations plus loading,
/// error and per-conversation turn flags.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatState {
    pub owner: Option<Identity>,
    /// Only meaningful once `loaded` is true.
    pub conversations: Vec<Conversation>,
    /// Whether `conversations` reflects a successful read of the store.
    pub loaded: bool,
    pub current_chat_id: Option<String>,
    pub is_loading: bool,
    pub error: Option<String>,
    /// Conversations that are not idle.
    pub turns: HashMap<String, TurnState>,
}

impl ChatState {
    pub fn conversation(&self, chat_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == chat_id)
    }

    pub fn turn_state(&self, chat_id: &str) -> TurnState {
        self.turns.get(chat_id).copied().unwrap_or(TurnState::Idle)
    }
}

#[derive(Default)]
struct Turns {
    /// User turns stored but not yet answered, per conversation.
    queued: HashMap<String, usize>,
    /// Cancellation for the turn currently being dispatched.
    in_flight: HashMap<String, CancellationToken>,
}

/// Orchestrates one signed-in owner's conversations: persists turns, asks the
/// dispatcher for replies and publishes every change on the bus.
pub struct Controller {
    store: Arc<dyn ConversationStore>,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<EventBus>,
    state: Mutex<ChatState>,
    // Replies on the same conversation are requested one after another.
    turn_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    turns: Mutex<Turns>,
    // Parent of every turn's token; cancelled on sign-out.
    session: Mutex<CancellationToken>,
    load_gate: AsyncMutex<()>,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        dispatcher: Arc<Dispatcher>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            bus,
            state: Mutex::new(ChatState::default()),
            turn_locks: Mutex::new(HashMap::new()),
            turns: Mutex::new(Turns::default()),
            session: Mutex::new(CancellationToken::new()),
            load_gate: AsyncMutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn turns(&self) -> MutexGuard<'_, Turns> {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_token(&self) -> CancellationToken {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn turn_lock(&self, chat_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.turn_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn snapshot(&self) -> ChatState {
        self.state().clone()
    }

    pub fn owner_id(&self) -> Option<String> {
        self.state().owner.as_ref().map(|o| o.owner_id.clone())
    }

    fn owns(&self, chat_id: &str) -> bool {
        self.state().conversation(chat_id).is_some()
    }

    /// True while any user turn is still waiting for its reply.
    pub fn is_busy(&self) -> bool {
        !self.turns().queued.is_empty()
    }

    /// Dismisses the user-visible error.
    pub fn clear_error(&self) {
        self.state().error = None;
    }

    // --- Auth reactions ---

    /// Identity became present: start over for this owner and load their
    /// conversations.
    pub async fn sign_in(&self, identity: Identity) {
        info!(owner = %identity, "identity present, loading conversations");
        {
            let mut state = self.state();
            *state = ChatState {
                owner: Some(identity),
                is_loading: true,
                ..ChatState::default()
            };
        }
        self.reload().await;
    }

    /// Signs `identity` in if needed and retries the conversation load until
    /// one succeeds. Concurrent callers share a single load.
    pub async fn ensure_loaded(&self, identity: &Identity) {
        if self.is_loaded_for(identity) {
            return;
        }

        let _gate = self.load_gate.lock().await;
        if self.is_loaded_for(identity) {
            return;
        }

        if self.owner_id().as_deref() == Some(identity.owner_id.as_str()) {
            self.reload().await;
        } else {
            self.sign_in(identity.clone()).await;
        }
    }

    fn is_loaded_for(&self, identity: &Identity) -> bool {
        let state = self.state();
        state.loaded
            && state.owner.as_ref().map(|o| o.owner_id.as_str()) == Some(identity.owner_id.as_str())
    }

    /// Identity went away: drop everything and abort pending turns.
    pub fn sign_out(&self) {
        {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            session.cancel();
            *session = CancellationToken::new();
        }
        *self.turns() = Turns::default();

        let owner = {
            let mut state = self.state();
            let owner = state.owner.take();
            *state = ChatState::default();
            owner
        };

        if let Some(owner) = owner {
            info!(owner = %owner, "identity cleared");
            self.bus.publish(Event::ConversationsChanged {
                owner_id: owner.owner_id,
                conversations: Vec::new(),
            });
        }
    }

    /// Reloads the owner's conversations from the store. On failure the
    /// previous list is kept and the error is surfaced; an unreadable store is
    /// never reported as "no conversations".
    pub async fn reload(&self) {
        let Some(owner_id) = self.owner_id() else {
            return;
        };

        let result = self.store.list_for_owner(&owner_id).await;

        match result {
            Ok(conversations) => {
                {
                    let mut state = self.state();
                    if state.owner.as_ref().map(|o| o.owner_id.as_str()) != Some(owner_id.as_str()) {
                        return;
                    }
                    let current_still_exists = state
                        .current_chat_id
                        .as_ref()
                        .map(|id| conversations.iter().any(|c| &c.id == id))
                        .unwrap_or(false);
                    if !current_still_exists {
                        state.current_chat_id = None;
                    }
                    state.conversations = conversations;
                    state.loaded = true;
                    state.is_loading = false;
                }
                self.publish_conversations();
            }
            Err(e) => {
                self.state().is_loading = false;
                self.surface(None, "Failed to load chats", &e.into());
            }
        }
    }

    // --- Conversation operations ---

    pub async fn create_new_chat(&self) -> Option<Conversation> {
        let Some(owner_id) = self.owner_id() else {
            self.surface(None, "Failed to create new chat", &ValidationError::SignedOut.into());
            return None;
        };

        let result = self.store.create(&owner_id).await;

        match result {
            Ok(conversation) => {
                {
                    let mut state = self.state();
                    state.conversations.insert(0, conversation.clone());
                    state.current_chat_id = Some(conversation.id.clone());
                }
                info!(chat_id = %conversation.id, "new chat");
                self.publish_conversations();
                Some(conversation)
            }
            Err(e) => {
                self.surface(None, "Failed to create new chat", &e.into());
                None
            }
        }
    }

    pub fn set_current_chat(&self, chat_id: &str) -> bool {
        let mut state = self.state();
        if state.conversation(chat_id).is_none() {
            return false;
        }
        state.current_chat_id = Some(chat_id.to_string());
        true
    }

    /// Adds a message to a conversation. User messages are stored right away
    /// and answered by the dispatcher under the given persona, one reply at a
    /// time per conversation; the reply is stored as an assistant message
    /// tagged with that persona. Failures end up in the `error` field, and a
    /// stored user message is kept even if no reply arrives.
    pub async fn add_message(
        &self,
        chat_id: &str,
        draft: Draft,
        role: Role,
        sender_id: Option<String>,
        persona: Option<String>,
    ) {
        let turn = composer::compose(draft);
        if turn.content.is_blank() {
            self.surface(
                Some(chat_id),
                "Failed to send message",
                &ValidationError::EmptyMessage.into(),
            );
            return;
        }
        if !self.owns(chat_id) {
            self.surface(
                Some(chat_id),
                "Failed to send message",
                &PersistenceError::NotFound(chat_id.to_string()).into(),
            );
            return;
        }

        let persona = Persona::resolve(persona.as_deref().unwrap_or(DEFAULT_PERSONA));
        let message = match role {
            Role::User => NewMessage::user(turn.content.clone(), sender_id),
            Role::Assistant => NewMessage::assistant(turn.content.clone(), persona.name.clone()),
            Role::System => NewMessage::system(turn.content.clone()),
        };

        if role != Role::User {
            if let Err(e) = self.persist(chat_id, message).await {
                self.surface(Some(chat_id), "Failed to send message", &e);
            }
            return;
        }

        let session = self.session_token();
        let stored = match self.persist(chat_id, message).await {
            Ok(stored) => stored,
            Err(e) => {
                self.surface(Some(chat_id), "Failed to send message", &e);
                return;
            }
        };

        *self.turns().queued.entry(chat_id.to_string()).or_insert(0) += 1;
        self.set_turn(chat_id, TurnState::AwaitingReply);

        let lock = self.turn_lock(chat_id);
        let _serial = lock.lock().await;

        let cancel = session.child_token();
        self.turns()
            .in_flight
            .insert(chat_id.to_string(), cancel.clone());

        let outcome = self
            .request_reply(chat_id, &stored, &turn, &persona, &cancel)
            .await;
        self.turns().in_flight.remove(chat_id);

        if session.is_cancelled() {
            // Signed out while waiting; nothing left to report to.
            return;
        }

        let failure = match outcome {
            Ok(reply) if reply.trim().is_empty() => {
                warn!(chat_id, "completion service returned an empty reply");
                self.notify(NotificationLevel::Warning, "The assistant returned an empty reply");
                None
            }
            Ok(reply) => {
                let reply = NewMessage::assistant(Content::text(reply), persona.name.clone());
                self.persist(chat_id, reply)
                    .await
                    .err()
                    .map(|e| ("Failed to save AI response", e))
            }
            Err(e) => Some(("Failed to get AI response", e)),
        };

        if let Some((context, e)) = failure {
            self.surface(Some(chat_id), context, &e);
            self.set_turn(chat_id, TurnState::ErrorSurfaced);
        }

        let remaining = {
            let mut turns = self.turns();
            let left = match turns.queued.get_mut(chat_id) {
                Some(n) => {
                    *n = n.saturating_sub(1);
                    *n
                }
                None => 0,
            };
            if left == 0 {
                turns.queued.remove(chat_id);
            }
            left
        };
        if remaining == 0 {
            self.set_turn(chat_id, TurnState::Idle);
        } else {
            self.set_turn(chat_id, TurnState::AwaitingReply);
        }
    }

    async fn request_reply(
        &self,
        chat_id: &str,
        stored: &Message,
        turn: &ComposedTurn,
        persona: &Persona,
        cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        // The store's order is authoritative. Everything before the turn is
        // history, plus replies that landed after it was stored; user turns
        // stored later wait for their own reply.
        let messages = self.store.messages(chat_id).await?;
        let Some(at) = messages.iter().position(|m| m.id == stored.id) else {
            return Err(PersistenceError::NotFound(chat_id.to_string()).into());
        };
        let prior: Vec<Message> = messages
            .into_iter()
            .enumerate()
            .filter(|(i, m)| *i < at || (*i > at && m.role != Role::User))
            .map(|(_, m)| m)
            .collect();
        let history = composer::to_history(&prior);

        Ok(self
            .dispatcher
            .complete(&history, turn, persona, cancel)
            .await?)
    }

    /// Aborts the reply being requested for `chat_id`, if any.
    pub fn cancel_turn(&self, chat_id: &str) -> bool {
        let token = self.turns().in_flight.get(chat_id).cloned();
        match token {
            Some(token) => {
                info!(chat_id, "cancelling pending turn");
                token.cancel();
                self.notify(NotificationLevel::Info, "Reply cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn delete_chat(&self, chat_id: &str) -> bool {
        if !self.owns(chat_id) {
            self.surface(
                Some(chat_id),
                "Failed to delete chat",
                &PersistenceError::NotFound(chat_id.to_string()).into(),
            );
            return false;
        }

        self.cancel_turn(chat_id);
        let result = self.store.delete(chat_id).await;

        let deleted = match result {
            Ok(true) => true,
            Ok(false) => {
                self.surface(
                    Some(chat_id),
                    "Failed to delete chat",
                    &PersistenceError::NotFound(chat_id.to_string()).into(),
                );
                false
            }
            Err(e) => {
                self.surface(Some(chat_id), "Failed to delete chat", &e.into());
                return false;
            }
        };

        // Either way the conversation no longer exists in the store.
        {
            let mut state = self.state();
            state.conversations.retain(|c| c.id != chat_id);
            state.turns.remove(chat_id);
            if state.current_chat_id.as_deref() == Some(chat_id) {
                state.current_chat_id = None;
            }
        }
        self.turn_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(chat_id);
        self.publish_conversations();
        deleted
    }

    pub async fn rename_chat(&self, chat_id: &str, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            self.surface(
                Some(chat_id),
                "Failed to rename chat",
                &ValidationError::EmptyTitle.into(),
            );
            return false;
        }
        if !self.owns(chat_id) {
            self.surface(
                Some(chat_id),
                "Failed to rename chat",
                &PersistenceError::NotFound(chat_id.to_string()).into(),
            );
            return false;
        }

        match self.store.rename(chat_id, title).await {
            Ok(Some(updated_at)) => {
                {
                    let mut state = self.state();
                    if let Some(pos) = state.conversations.iter().position(|c| c.id == chat_id) {
                        let mut conv = state.conversations.remove(pos);
                        conv.title = title.to_string();
                        if updated_at > conv.updated_at {
                            conv.updated_at = updated_at;
                        }
                        state.conversations.insert(0, conv);
                    }
                }
                self.publish_conversations();
                true
            }
            Ok(None) => {
                self.surface(
                    Some(chat_id),
                    "Failed to rename chat",
                    &PersistenceError::NotFound(chat_id.to_string()).into(),
                );
                false
            }
            Err(e) => {
                self.surface(Some(chat_id), "Failed to rename chat", &e.into());
                false
            }
        }
    }

    // --- Internals ---

    async fn persist(&self, chat_id: &str, message: NewMessage) -> Result<Message, ChatError> {
        let stored = self.store.append(chat_id, message).await?;

        {
            let mut state = self.state();
            if let Some(pos) = state.conversations.iter().position(|c| c.id == chat_id) {
                let mut conv = state.conversations.remove(pos);
                let at = conv
                    .messages
                    .partition_point(|m| m.created_at <= stored.created_at);
                conv.messages.insert(at, stored.clone());
                if stored.created_at > conv.updated_at {
                    conv.updated_at = stored.created_at;
                }
                state.conversations.insert(0, conv);
            }
        }

        self.publish_conversations();
        Ok(stored)
    }

    fn set_turn(&self, chat_id: &str, turn: TurnState) {
        let owner_id = {
            let mut state = self.state();
            if turn == TurnState::Idle {
                state.turns.remove(chat_id);
            } else {
                state.turns.insert(chat_id.to_string(), turn);
            }
            state.owner.as_ref().map(|o| o.owner_id.clone())
        };

        if let Some(owner_id) = owner_id {
            self.bus.publish(Event::TurnState {
                owner_id,
                chat_id: chat_id.to_string(),
                state: turn,
            });
        }
    }

    fn publish_conversations(&self) {
        let event = {
            let state = self.state();
            state.owner.as_ref().map(|o| Event::ConversationsChanged {
                owner_id: o.owner_id.clone(),
                conversations: state.conversations.clone(),
            })
        };
        if let Some(event) = event {
            self.bus.publish(event);
        }
    }

    fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        if let Some(owner_id) = self.owner_id() {
            self.bus.publish(Event::Notification {
                owner_id,
                level,
                message: message.into(),
            });
        }
    }

    /// Records `err` as the user-visible error and notifies subscribers.
    fn surface(&self, chat_id: Option<&str>, context: &str, err: &ChatError) {
        let message = format!("{}: {}", context, err);
        error!(chat_id = ?chat_id, "{}", message);

        self.state().error = Some(message.clone());
        self.notify(NotificationLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Part;
    use crate::composer::Attachment;
    use crate::llm::assistant::{AssistantProvisioner, PollPolicy};
    use crate::llm::testing::ScriptedCompletions;
    use crate::llm::{AssistantSpec, DispatchSettings, RunStatus};
    use crate::store::testing::FlakyStore;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Harness {
        controller: Arc<Controller>,
        service: Arc<ScriptedCompletions>,
        store: Arc<FlakyStore>,
        bus: Arc<EventBus>,
    }

    fn fast_poll() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 5,
            max_wait: Duration::from_secs(5),
        }
    }

    async fn harness(service: ScriptedCompletions) -> Harness {
        harness_with_poll(service, fast_poll()).await
    }

    async fn harness_with_poll(service: ScriptedCompletions, poll: PollPolicy) -> Harness {
        let service = Arc::new(service);
        let store = Arc::new(FlakyStore::new().await);
        let bus = Arc::new(EventBus::new());
        let dispatcher = Arc::new(Dispatcher::new(
            service.clone(),
            Arc::new(AssistantProvisioner::new(AssistantSpec::file_analysis(
                "gpt-4-turbo-preview",
            ))),
            DispatchSettings {
                poll,
                ..DispatchSettings::default()
            },
        ));
        let controller = Arc::new(Controller::new(store.clone(), dispatcher, bus.clone()));
        controller.sign_in(Identity::new("owner-1")).await;
        Harness {
            controller,
            service,
            store,
            bus,
        }
    }

    fn turn_events(rx: &mut tokio::sync::broadcast::Receiver<Event>, chat: &str) -> Vec<TurnState> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(Event::TurnState { chat_id, state, .. }) if chat_id == chat => out.push(state),
                Ok(_) => {}
                Err(TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
        out
    }

    fn spawn_turn(controller: &Arc<Controller>, chat_id: &str, text: &str) -> tokio::task::JoinHandle<()> {
        let c = controller.clone();
        let id = chat_id.to_string();
        let text = text.to_string();
        tokio::spawn(async move {
            c.add_message(&id, Draft::Text(text), Role::User, None, None)
                .await
        })
    }

    async fn wait_for_turn(controller: &Controller, chat_id: &str, want: TurnState) {
        for _ in 0..400 {
            if controller.snapshot().turn_state(chat_id) == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("chat {} never reached {:?}", chat_id, want);
    }

    #[tokio::test]
    async fn text_turn_stores_user_and_assistant_messages() {
        let h = harness(ScriptedCompletions::replying("Hi there")).await;
        let conv = h.controller.create_new_chat().await.unwrap();

        h.controller
            .add_message(
                &conv.id,
                Draft::Text("Hello".into()),
                Role::User,
                Some("owner-1".into()),
                None,
            )
            .await;

        let stored = h.store.get(&conv.id).await.unwrap().unwrap();
        let roles: Vec<Role> = stored.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(stored.messages[1].content, Content::text("Hi there"));
        assert_eq!(stored.messages[0].sender_id.as_deref(), Some("owner-1"));
        assert!(stored.messages[0].ai_agent.is_none());
        assert_eq!(stored.messages[1].ai_agent.as_deref(), Some(DEFAULT_PERSONA));
        assert!(stored.messages[1].sender_id.is_none());

        // updated_at moved forward once per append
        assert!(stored.messages[0].created_at > conv.updated_at);
        assert!(stored.messages[1].created_at > stored.messages[0].created_at);
        assert_eq!(stored.updated_at, stored.messages[1].created_at);

        let state = h.controller.snapshot();
        assert!(state.loaded);
        assert!(state.error.is_none());
        assert_eq!(state.turn_state(&conv.id), TurnState::Idle);
        let local = state.conversation(&conv.id).unwrap();
        assert_eq!(local.messages, stored.messages);
        assert_eq!(local.updated_at, stored.updated_at);
    }

    #[tokio::test]
    async fn image_turn_without_text_goes_to_vision_path() {
        let h = harness(ScriptedCompletions::replying("A cat.")).await;
        let conv = h.controller.create_new_chat().await.unwrap();

        h.controller
            .add_message(
                &conv.id,
                Draft::WithAttachment {
                    text: String::new(),
                    attachment: Attachment {
                        file_name: "cat.jpg".into(),
                        mime_type: Some("image/jpeg".into()),
                        bytes: vec![0xff, 0xd8, 0xff],
                    },
                },
                Role::User,
                None,
                None,
            )
            .await;

        let messages = h.store.messages(&conv.id).await.unwrap();
        match &messages[0].content {
            Content::Structured { parts, .. } => {
                assert_eq!(parts.len(), 1);
                assert!(matches!(parts[0], Part::Image { .. }));
            }
            other => panic!("expected structured content, got {:?}", other),
        }

        let requests = h.service.chat_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, DispatchSettings::default().vision_model);
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn document_turn_is_answered_by_analysis() {
        let h = harness(
            ScriptedCompletions::replying("unused")
                .with_run_statuses(vec![RunStatus::InProgress, RunStatus::Completed])
                .with_latest_message(Some("Revenue grew 12%.")),
        )
        .await;
        let conv = h.controller.create_new_chat().await.unwrap();

        h.controller
            .add_message(
                &conv.id,
                Draft::WithAttachment {
                    text: String::new(),
                    attachment: Attachment {
                        file_name: "q3.pdf".into(),
                        mime_type: None,
                        bytes: vec![1, 2, 3],
                    },
                },
                Role::User,
                None,
                Some("CEO".into()),
            )
            .await;

        let messages = h.store.messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content.file().unwrap().file_type, "application/pdf");
        assert_eq!(messages[1].content, Content::text("Revenue grew 12%."));
        assert_eq!(messages[1].ai_agent.as_deref(), Some("CEO"));
        assert_eq!(
            h.service.thread_messages(),
            vec![crate::composer::DOCUMENT_PROMPT.to_string()]
        );
        assert_eq!(h.service.files_deleted().len(), 1);
        assert!(h.service.chat_requests().is_empty());
    }

    #[tokio::test]
    async fn cancelling_document_analysis_stops_polling() {
        let h = harness_with_poll(
            ScriptedCompletions::replying("unused")
                .with_run_statuses(vec![RunStatus::InProgress; 1000]),
            PollPolicy {
                interval: Duration::from_millis(20),
                max_attempts: 1000,
                max_wait: Duration::from_secs(60),
            },
        )
        .await;
        let conv = h.controller.create_new_chat().await.unwrap();

        let task = {
            let c = h.controller.clone();
            let id = conv.id.clone();
            tokio::spawn(async move {
                c.add_message(
                    &id,
                    Draft::WithAttachment {
                        text: "summarize".into(),
                        attachment: Attachment {
                            file_name: "notes.txt".into(),
                            mime_type: Some("text/plain".into()),
                            bytes: b"hello".to_vec(),
                        },
                    },
                    Role::User,
                    None,
                    None,
                )
                .await
            })
        };

        for _ in 0..400 {
            if h.service.status_polls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.service.status_polls() > 0);
        assert!(h.controller.cancel_turn(&conv.id));
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let polls = h.service.status_polls();
        assert!(polls < 1000);
        assert_eq!(h.service.runs_cancelled(), 1);
        assert_eq!(h.service.files_deleted().len(), 1);

        let state = h.controller.snapshot();
        assert!(state.error.as_ref().unwrap().contains("cancelled"));
        assert_eq!(state.turn_state(&conv.id), TurnState::Idle);
        assert_eq!(h.store.messages(&conv.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_failure_keeps_user_message_and_surfaces_error() {
        let h = harness(ScriptedCompletions::failing(500, "boom")).await;
        let conv = h.controller.create_new_chat().await.unwrap();
        let mut rx = h.bus.subscribe();

        h.controller
            .add_message(&conv.id, Draft::Text("Hello".into()), Role::User, None, None)
            .await;

        let messages = h.store.messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);

        let state = h.controller.snapshot();
        let error = state.error.clone().unwrap();
        assert!(error.starts_with("Failed to get AI response"), "{}", error);
        assert_eq!(state.turn_state(&conv.id), TurnState::Idle);
        assert_eq!(
            turn_events(&mut rx, &conv.id),
            vec![
                TurnState::AwaitingReply,
                TurnState::ErrorSurfaced,
                TurnState::Idle
            ]
        );

        h.controller.clear_error();
        assert!(h.controller.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn persona_is_tagged_on_the_reply() {
        let h = harness(ScriptedCompletions::replying("Grow.")).await;
        let conv = h.controller.create_new_chat().await.unwrap();

        h.controller
            .add_message(
                &conv.id,
                Draft::Text("Strategy?".into()),
                Role::User,
                None,
                Some("CEO".into()),
            )
            .await;

        let messages = h.store.messages(&conv.id).await.unwrap();
        assert_eq!(messages[1].ai_agent.as_deref(), Some("CEO"));
        let system = &h.service.chat_requests()[0].messages[0];
        assert!(system.content.to_plain_text().starts_with("You are the CEO AI"));
    }

    #[tokio::test]
    async fn second_turn_is_stored_while_first_awaits_reply() {
        let h = harness(
            ScriptedCompletions::replying("ack").with_delay(Duration::from_millis(400)),
        )
        .await;
        let conv = h.controller.create_new_chat().await.unwrap();

        let first = spawn_turn(&h.controller, &conv.id, "one");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = spawn_turn(&h.controller, &conv.id, "two");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pending = h.store.messages(&conv.id).await.unwrap();
        let texts: Vec<String> = pending.iter().map(|m| m.content.to_plain_text()).collect();
        assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(
            h.controller.snapshot().turn_state(&conv.id),
            TurnState::AwaitingReply
        );

        first.await.unwrap();
        // The first reply is in, but the second turn is still waiting.
        assert_eq!(
            h.controller.snapshot().turn_state(&conv.id),
            TurnState::AwaitingReply
        );
        second.await.unwrap();
        assert_eq!(h.controller.snapshot().turn_state(&conv.id), TurnState::Idle);
    }

    #[tokio::test]
    async fn queued_turn_sees_the_reply_to_the_earlier_one() {
        let h = harness(
            ScriptedCompletions::replying("ack").with_delay(Duration::from_millis(50)),
        )
        .await;
        let conv = h.controller.create_new_chat().await.unwrap();

        let first = spawn_turn(&h.controller, &conv.id, "one");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = spawn_turn(&h.controller, &conv.id, "two");
        first.await.unwrap();
        second.await.unwrap();

        let messages = h.store.messages(&conv.id).await.unwrap();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::User, Role::Assistant, Role::Assistant]
        );

        // system, "one", first reply, "two"
        let requests = h.service.chat_requests();
        assert_eq!(requests.len(), 2);
        let second_request: Vec<String> = requests[1]
            .messages
            .iter()
            .map(|m| m.content.to_plain_text())
            .collect();
        assert_eq!(second_request.len(), 4);
        assert_eq!(&second_request[1..], &["one", "ack", "two"]);
        assert_eq!(requests[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn assistant_messages_are_stored_without_dispatch() {
        let h = harness(ScriptedCompletions::replying("unused")).await;
        let conv = h.controller.create_new_chat().await.unwrap();

        h.controller
            .add_message(
                &conv.id,
                Draft::Text("Welcome back".into()),
                Role::Assistant,
                Some("ignored".into()),
                Some("CMO".into()),
            )
            .await;

        let messages = h.store.messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].ai_agent.as_deref(), Some("CMO"));
        assert!(messages[0].sender_id.is_none());
        assert!(h.service.chat_requests().is_empty());
    }

    #[tokio::test]
    async fn empty_reply_is_not_stored_and_warns() {
        let h = harness(ScriptedCompletions::replying("  ")).await;
        let conv = h.controller.create_new_chat().await.unwrap();
        let mut rx = h.bus.subscribe();

        h.controller
            .add_message(&conv.id, Draft::Text("Hello".into()), Role::User, None, None)
            .await;

        assert_eq!(h.store.messages(&conv.id).await.unwrap().len(), 1);
        let mut warned = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::Notification { level, .. } = event {
                warned |= level == NotificationLevel::Warning;
            }
        }
        assert!(warned);
        assert!(h.controller.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let h = harness(ScriptedCompletions::replying("unused")).await;
        let conv = h.controller.create_new_chat().await.unwrap();

        h.controller
            .add_message(&conv.id, Draft::Text("   ".into()), Role::User, None, None)
            .await;

        assert!(h.store.messages(&conv.id).await.unwrap().is_empty());
        assert!(h
            .controller
            .snapshot()
            .error
            .unwrap()
            .contains("message must not be empty"));
    }

    #[tokio::test]
    async fn messages_to_foreign_chats_are_refused() {
        let h = harness(ScriptedCompletions::replying("unused")).await;
        let foreign = h.store.create("owner-2").await.unwrap();

        h.controller
            .add_message(&foreign.id, Draft::Text("hi".into()), Role::User, None, None)
            .await;

        assert!(h.store.messages(&foreign.id).await.unwrap().is_empty());
        assert!(h.controller.snapshot().error.is_some());
    }

    #[tokio::test]
    async fn failed_first_load_is_not_an_empty_list() {
        let h = harness(ScriptedCompletions::replying("ok")).await;
        let existing = h.store.create("owner-2").await.unwrap();
        let controller = Controller::new(
            h.store.clone(),
            Arc::new(Dispatcher::new(
                h.service.clone(),
                Arc::new(AssistantProvisioner::new(AssistantSpec::file_analysis("m"))),
                DispatchSettings::default(),
            )),
            h.bus.clone(),
        );
        let owner = Identity::new("owner-2");

        h.store.fail_next_lists(1);
        controller.ensure_loaded(&owner).await;
        let state = controller.snapshot();
        assert!(!state.loaded);
        assert!(!state.is_loading);
        assert!(state.error.unwrap().starts_with("Failed to load chats"));

        // The next caller retries and gets the real list.
        controller.ensure_loaded(&owner).await;
        let state = controller.snapshot();
        assert!(state.loaded);
        assert_eq!(state.conversations.len(), 1);
        assert_eq!(state.conversations[0].id, existing.id);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_list() {
        let h = harness(ScriptedCompletions::replying("ok")).await;
        let conv = h.controller.create_new_chat().await.unwrap();

        h.store.fail_next_lists(1);
        h.controller.reload().await;

        let state = h.controller.snapshot();
        assert!(state.loaded);
        assert_eq!(state.conversations.len(), 1);
        assert_eq!(state.conversations[0].id, conv.id);
        assert!(state.error.unwrap().starts_with("Failed to load chats"));
    }

    #[tokio::test]
    async fn delete_removes_chat_and_messages() {
        let h = harness(ScriptedCompletions::replying("ok")).await;
        let conv = h.controller.create_new_chat().await.unwrap();
        h.controller
            .add_message(&conv.id, Draft::Text("Hello".into()), Role::User, None, None)
            .await;

        assert!(h.controller.delete_chat(&conv.id).await);

        let state = h.controller.snapshot();
        assert!(state.conversation(&conv.id).is_none());
        assert!(state.current_chat_id.is_none());
        assert!(h.store.messages(&conv.id).await.unwrap().is_empty());
        assert!(!h.controller.delete_chat(&conv.id).await);
    }

    #[tokio::test]
    async fn rename_validates_title_and_moves_chat_to_top() {
        let h = harness(ScriptedCompletions::replying("ok")).await;
        let older = h.controller.create_new_chat().await.unwrap();
        let newer = h.controller.create_new_chat().await.unwrap();
        assert_eq!(h.controller.snapshot().conversations[0].id, newer.id);

        assert!(!h.controller.rename_chat(&older.id, "  ").await);
        assert!(h
            .controller
            .snapshot()
            .error
            .unwrap()
            .contains("title must not be empty"));

        h.controller.clear_error();
        assert!(h.controller.rename_chat(&older.id, "Launch plan").await);

        let state = h.controller.snapshot();
        assert!(state.error.is_none());
        let local = &state.conversations[0];
        assert_eq!(local.id, older.id);
        assert_eq!(local.title, "Launch plan");

        let stored = h.store.get(&older.id).await.unwrap().unwrap();
        assert_eq!(local.updated_at, stored.updated_at);
        assert!(stored.updated_at > older.updated_at);
    }

    #[tokio::test]
    async fn sign_out_clears_and_sign_in_reloads() {
        let h = harness(ScriptedCompletions::replying("ok")).await;
        let conv = h.controller.create_new_chat().await.unwrap();
        h.controller
            .add_message(&conv.id, Draft::Text("Hello".into()), Role::User, None, None)
            .await;

        h.controller.sign_out();
        let state = h.controller.snapshot();
        assert!(state.owner.is_none());
        assert!(!state.loaded);
        assert!(state.conversations.is_empty());
        assert!(h.controller.create_new_chat().await.is_none());

        h.controller.sign_in(Identity::new("owner-1")).await;
        let state = h.controller.snapshot();
        assert!(!state.is_loading);
        assert!(state.loaded);
        assert_eq!(state.conversations.len(), 1);
        assert_eq!(state.conversations[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn sign_out_abandons_pending_turns() {
        let h = harness(
            ScriptedCompletions::replying("too late").with_delay(Duration::from_secs(30)),
        )
        .await;
        let conv = h.controller.create_new_chat().await.unwrap();

        let task = spawn_turn(&h.controller, &conv.id, "Hello");
        wait_for_turn(&h.controller, &conv.id, TurnState::AwaitingReply).await;
        assert!(h.controller.is_busy());

        h.controller.sign_out();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert!(!h.controller.is_busy());
        assert!(h.controller.snapshot().error.is_none());
        assert_eq!(h.store.messages(&conv.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelling_a_pending_turn_returns_to_idle() {
        let h = harness(
            ScriptedCompletions::replying("too late").with_delay(Duration::from_secs(30)),
        )
        .await;
        let conv = h.controller.create_new_chat().await.unwrap();

        let task = spawn_turn(&h.controller, &conv.id, "Hello");
        wait_for_turn(&h.controller, &conv.id, TurnState::AwaitingReply).await;
        for _ in 0..400 {
            if h.controller.cancel_turn(&conv.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let state = h.controller.snapshot();
        assert_eq!(state.turn_state(&conv.id), TurnState::Idle);
        assert!(state.error.as_ref().unwrap().contains("cancelled"));
        assert_eq!(h.store.messages(&conv.id).await.unwrap().len(), 1);
        assert!(!h.controller.is_busy());
    }

    #[tokio::test]
    async fn mutations_are_published() {
        let h = harness(ScriptedCompletions::replying("ok")).await;
        let mut rx = h.bus.subscribe();

        let conv = h.controller.create_new_chat().await.unwrap();

        match rx.recv().await.unwrap() {
            Event::ConversationsChanged {
                owner_id,
                conversations,
            } => {
                assert_eq!(owner_id, "owner-1");
                assert_eq!(conversations[0].id, conv.id);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
