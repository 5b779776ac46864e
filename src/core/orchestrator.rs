use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::models::{split_qualified, ModelRegistry};
use crate::api::{ConversationMeta, StreamEvent, UsageStats};
use crate::core::chat_stream::{
    spawn_stop_request, ChatStreamService, StreamKey, StreamMessage, StreamParams,
};
use crate::core::content::{build_content, Content, Part};
use crate::core::conversations::{ConversationStore, StoreError};
use crate::core::dispatch::{build_request, resolve_slot, DispatchSnapshot, TargetSlot};
use crate::core::error::TargetError;
use crate::core::history::{append_user_message, build_history, outgoing_from_message};
use crate::core::message::{ComparisonResult, ComparisonStatus, Message};
use crate::core::turn::{TargetId, Turn, TurnPhase};

#[derive(Debug, Error)]
pub enum SendError {
    /// A turn already in flight is rejected, not queued.
    #[error("a turn is already in flight")]
    TurnInFlight,

    #[error("message is empty")]
    EmptyMessage,

    #[error("no provider known for model '{0}'")]
    UnknownModel(String),

    #[error("no such user message: {0}")]
    UnknownMessage(String),

    #[error("no assistant message to retry against")]
    NothingToRetry,

    #[error("no active turn")]
    NoActiveTurn,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Work the engine asks its runtime to perform. Keeping spawns out of the
/// state machine lets tests drive turns without any network.
#[derive(Debug)]
pub enum EngineCommand {
    SpawnStream(StreamParams),
    NotifyStop { request_id: String },
}

/// Engine settings captured into a per-dispatch snapshot at send time. A
/// request in flight never observes later settings changes.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Primary model, bare or `provider::model` qualified.
    pub model: String,
    /// Comparison targets, each `provider::model` qualified or registry-known.
    pub comparison_models: Vec<String>,
    pub tools_enabled: bool,
    pub tools: Vec<String>,
    pub reasoning_effort: Option<String>,
    pub system_prompt: Option<String>,
}

/// The streaming orchestration engine: owns conversation state, fans a user
/// turn out to one primary and any number of comparison targets, folds the
/// interleaved event streams back into that state, and settles the turn once
/// every target has reported a terminal event.
///
/// All state mutation happens on the caller's task through [`apply`]; the
/// transport tasks only produce `(message, key)` pairs. Updates addressed to
/// a turn or target that is no longer active are discarded.
///
/// [`apply`]: Orchestrator::apply
pub struct Orchestrator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    registry: ModelRegistry,
    settings: EngineSettings,
    store: Arc<dyn ConversationStore>,
    stream: ChatStreamService,
    rx: mpsc::UnboundedReceiver<(StreamMessage, StreamKey)>,
    messages: Vec<Message>,
    conversation_id: Option<String>,
    conversation_title: Option<String>,
    linked_conversations: HashMap<String, String>,
    turn: Option<Turn>,
    turn_seq: u64,
    last_turn_error: Option<String>,
}

impl Orchestrator {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        registry: ModelRegistry,
        settings: EngineSettings,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let (stream, rx) = ChatStreamService::new();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            registry,
            settings,
            store,
            stream,
            rx,
            messages: Vec::new(),
            conversation_id: None,
            conversation_title: None,
            linked_conversations: HashMap::new(),
            turn: None,
            turn_seq: 0,
            last_turn_error: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.turn.is_none()
    }

    pub fn phase(&self) -> Option<TurnPhase> {
        self.turn.as_ref().map(|turn| turn.phase)
    }

    pub fn active_turn_id(&self) -> Option<u64> {
        self.turn.as_ref().map(|turn| turn.id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn conversation_title(&self) -> Option<&str> {
        self.conversation_title.as_deref()
    }

    pub fn linked_conversation(&self, model: &str) -> Option<&str> {
        self.linked_conversations.get(model).map(String::as_str)
    }

    pub fn last_turn_error(&self) -> Option<&str> {
        self.last_turn_error.as_deref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Settings apply from the next dispatch on; in-flight requests keep the
    /// snapshot they were built with.
    pub fn set_settings(&mut self, settings: EngineSettings) {
        self.settings = settings;
    }

    /// Primary-response throughput for the active turn, if any.
    pub fn tokens_per_second(&self) -> Option<f64> {
        self.turn
            .as_ref()
            .and_then(|turn| turn.token_rate.tokens_per_second())
    }

    /// Start a turn: append the user message and the assistant placeholder,
    /// then dispatch the primary and every active comparison target.
    ///
    /// When comparison targets are active and no conversation exists yet,
    /// one is created up front so that all targets dispatch in parallel
    /// under a shared parent id. Without comparison targets the primary
    /// dispatches alone and adopts whatever conversation id its stream
    /// reports.
    pub async fn send(
        &mut self,
        text: &str,
        attachments: &[Part],
    ) -> Result<Vec<EngineCommand>, SendError> {
        if self.turn.is_some() {
            return Err(SendError::TurnInFlight);
        }

        let content = build_content(text, attachments);
        if content.is_empty() {
            return Err(SendError::EmptyMessage);
        }

        let comparisons = self.settings.comparison_models.clone();
        self.resolve_model(&self.settings.model)?;
        for model in &comparisons {
            self.resolve_model(model)?;
        }

        if !comparisons.is_empty() {
            self.ensure_conversation().await?;
        }

        self.last_turn_error = None;
        let user = Message::user(content);
        let user_id = user.id.clone();
        self.messages.push(user);
        self.begin_turn(user_id, &comparisons)
    }

    /// Re-run a turn from an earlier user message: rewind the conversation
    /// to the base subset ending at that message (optionally with edited
    /// content), reuse its id, and dispatch again without appending a
    /// duplicate user message.
    pub async fn regenerate(
        &mut self,
        user_message_id: &str,
        new_content: Option<Content>,
    ) -> Result<Vec<EngineCommand>, SendError> {
        if self.turn.is_some() {
            return Err(SendError::TurnInFlight);
        }

        let position = self
            .messages
            .iter()
            .position(|message| message.is_user() && message.id == user_message_id)
            .ok_or_else(|| SendError::UnknownMessage(user_message_id.to_string()))?;

        let comparisons = self.settings.comparison_models.clone();
        self.resolve_model(&self.settings.model)?;
        for model in &comparisons {
            self.resolve_model(model)?;
        }

        if let Some(content) = new_content {
            if content.is_empty() {
                return Err(SendError::EmptyMessage);
            }
            if let Some(conversation_id) = self.conversation_id.clone() {
                // Best-effort edit propagation; local state drives the turn.
                if let Err(e) = self
                    .store
                    .edit_message(&conversation_id, user_message_id, &content)
                    .await
                {
                    warn!(error = %e, "failed to persist message edit");
                }
            }
            self.messages[position].content = content;
        }

        self.messages.truncate(position + 1);

        if !comparisons.is_empty() {
            self.ensure_conversation().await?;
        }

        self.last_turn_error = None;
        self.begin_turn(user_message_id.to_string(), &comparisons)
    }

    /// Re-run a single comparison target against the latest assistant
    /// message, leaving the rest of the turn's results in place.
    pub fn retry_comparison(&mut self, model: &str) -> Result<Vec<EngineCommand>, SendError> {
        if self.turn.is_some() {
            return Err(SendError::TurnInFlight);
        }
        self.resolve_model(model)?;

        let last_index = self
            .messages
            .len()
            .checked_sub(1)
            .ok_or(SendError::NothingToRetry)?;
        if !self.messages[last_index].is_assistant() {
            return Err(SendError::NothingToRetry);
        }
        let assistant_id = self.messages[last_index].id.clone();
        let user_id = self.messages[..last_index]
            .iter()
            .rev()
            .find(|message| message.is_user())
            .map(|message| message.id.clone())
            .ok_or(SendError::NothingToRetry)?;

        self.messages[last_index]
            .comparison_results
            .insert(model.to_string(), ComparisonResult::streaming());

        self.turn_seq += 1;
        self.turn = Some(Turn::new(self.turn_seq, user_id, assistant_id));
        let command = self.dispatch_target(TargetId::Comparison(model.to_string()), true)?;
        if let Some(turn) = self.turn.as_mut() {
            turn.phase = TurnPhase::Streaming;
        }
        Ok(vec![command])
    }

    /// Cancel the active turn. Idempotent; the engine returns to idle
    /// immediately and every later event for the turn is discarded. Partial
    /// content stays as streamed. Returns best-effort backend stop
    /// notifications for the requests still in flight.
    pub fn stop(&mut self) -> Vec<EngineCommand> {
        let Some(turn) = self.turn.take() else {
            return Vec::new();
        };
        turn.cancel.cancel();

        let commands: Vec<EngineCommand> = turn
            .unsettled_request_ids()
            .into_iter()
            .map(|request_id| EngineCommand::NotifyStop { request_id })
            .collect();

        // No comparison slot stays `streaming` once the turn is gone.
        if let Some(last) = self.messages.last_mut() {
            if last.is_assistant() && last.id == turn.assistant_message_id {
                for result in last.comparison_results.values_mut() {
                    if result.status == ComparisonStatus::Streaming {
                        result.status = ComparisonStatus::Complete;
                    }
                }
            }
        }

        debug!(turn = turn.id, "turn stopped");
        commands
    }

    /// Fold one transport update into state. Updates whose turn id or target
    /// no longer matches the active turn are no-ops. May hand back a command
    /// (the non-streaming retry) for the runtime to execute.
    pub fn apply(&mut self, message: StreamMessage, key: StreamKey) -> Option<EngineCommand> {
        let registered = self
            .turn
            .as_ref()
            .map(|turn| turn.id == key.turn_id && turn.targets.contains_key(&key.target))
            .unwrap_or(false);
        if !registered {
            debug!(turn = key.turn_id, target = %key.target, "discarding stale stream update");
            return None;
        }

        match message {
            StreamMessage::Event(event) => self.apply_event(key.target, event),
            StreamMessage::Failed(error) => self.apply_failure(key.target, error),
        }
    }

    /// Execute a command produced by the engine.
    pub fn execute(&self, command: EngineCommand) {
        match command {
            EngineCommand::SpawnStream(params) => self.stream.spawn_request(params),
            EngineCommand::NotifyStop { request_id } => spawn_stop_request(
                self.client.clone(),
                self.base_url.clone(),
                self.api_key.clone(),
                request_id,
            ),
        }
    }

    /// Pump transport updates until the active turn settles, reporting each
    /// update to the observer before it is applied.
    pub async fn drive<F>(&mut self, mut observe: F)
    where
        F: FnMut(&StreamKey, &StreamMessage),
    {
        while self.turn.is_some() {
            let Some((message, key)) = self.rx.recv().await else {
                break;
            };
            observe(&key, &message);
            if let Some(command) = self.apply(message, key) {
                self.execute(command);
            }
        }
    }

    fn apply_event(&mut self, target: TargetId, event: StreamEvent) -> Option<EngineCommand> {
        match event {
            StreamEvent::Text(chunk) => {
                self.apply_text(&target, &chunk);
                None
            }
            StreamEvent::ToolCall(delta) => {
                self.with_slot(&target, |slot| slot.apply_tool_call(&delta));
                None
            }
            StreamEvent::ToolOutput(output) => {
                self.with_slot(&target, move |slot| slot.apply_tool_output(output));
                None
            }
            StreamEvent::Usage(usage) => {
                self.apply_usage(&target, usage);
                None
            }
            StreamEvent::Conversation(meta) => {
                self.apply_conversation(&target, meta);
                None
            }
            StreamEvent::Final(content) => {
                self.apply_final(target, content);
                None
            }
        }
    }

    fn apply_failure(&mut self, target: TargetId, error: TargetError) -> Option<EngineCommand> {
        if error.is_cancelled() {
            self.with_slot(&target, |slot| slot.mark_stopped());
            self.settle_target(&target, Some(TargetError::Cancelled));
            return None;
        }

        match &target {
            TargetId::Primary => {
                let first_attempt = self
                    .turn
                    .as_ref()
                    .and_then(|turn| turn.target(&target))
                    .map(|state| state.attempt == 1)
                    .unwrap_or(false);

                if error.is_streaming_unsupported() && first_attempt {
                    debug!("primary target rejected streaming, retrying without it");
                    match self.dispatch_target(TargetId::Primary, false) {
                        Ok(command) => return Some(command),
                        Err(dispatch_error) => {
                            warn!(error = %dispatch_error, "non-streaming retry could not be dispatched");
                        }
                    }
                }

                warn!(error = %error, "primary target failed");
                self.last_turn_error = Some(error.to_string());
                if let Some(turn) = self.turn.as_ref() {
                    // A failed primary stops the whole turn.
                    turn.cancel.cancel();
                }
                self.settle_target(&target, Some(error));
                None
            }
            TargetId::Comparison(_) => {
                debug!(target = %target, error = %error, "comparison target failed");
                let message = error.to_string();
                self.with_slot(&target, move |slot| slot.mark_error(message));
                self.settle_target(&target, Some(error));
                None
            }
        }
    }

    fn apply_text(&mut self, target: &TargetId, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let applied = self.with_slot(target, |slot| slot.append_text(chunk));
        if applied && target.is_primary() {
            if let Some(turn) = self.turn.as_mut() {
                turn.token_rate.observe_chars(chunk.len());
            }
        }
    }

    fn apply_usage(&mut self, target: &TargetId, usage: UsageStats) {
        let completion_tokens = usage.completion_tokens;
        let applied = self.with_slot(target, move |slot| slot.apply_usage(usage));
        if applied && target.is_primary() {
            if let (Some(turn), Some(tokens)) = (self.turn.as_mut(), completion_tokens) {
                turn.token_rate.finalize(tokens);
            }
        }
    }

    fn apply_conversation(&mut self, target: &TargetId, meta: ConversationMeta) {
        match target {
            TargetId::Primary => match &self.conversation_id {
                None => {
                    debug!(conversation = %meta.id, "adopting conversation");
                    self.conversation_title = meta.title.clone();
                    self.conversation_id = Some(meta.id);
                }
                Some(current) if *current == meta.id => {
                    if meta.title.is_some() {
                        self.conversation_title = meta.title;
                    }
                }
                Some(current) => {
                    debug!(
                        bound = %current,
                        received = %meta.id,
                        "ignoring duplicate conversation notification"
                    );
                }
            },
            TargetId::Comparison(_) => {
                if let Some(state) = self
                    .turn
                    .as_mut()
                    .and_then(|turn| turn.target_mut(target))
                {
                    state.conversation_id = Some(meta.id);
                }
            }
        }
    }

    fn apply_final(&mut self, target: TargetId, content: Content) {
        self.with_slot(&target, |slot| slot.finalize(content));

        if let TargetId::Comparison(key) = &target {
            let reported = self
                .turn
                .as_ref()
                .and_then(|turn| turn.target(&target))
                .and_then(|state| state.conversation_id.clone());
            if let Some(conversation_id) = reported {
                // First success binds the linked conversation; later turns reuse it.
                self.linked_conversations
                    .entry(key.clone())
                    .or_insert(conversation_id);
            }
        }

        self.settle_target(&target, None);
    }

    fn with_slot<F>(&mut self, target: &TargetId, update: F) -> bool
    where
        F: FnOnce(&mut TargetSlot<'_>),
    {
        let Some(assistant_id) = self
            .turn
            .as_ref()
            .map(|turn| turn.assistant_message_id.clone())
        else {
            return false;
        };
        match resolve_slot(&mut self.messages, &assistant_id, target) {
            Some(mut slot) => {
                update(&mut slot);
                true
            }
            None => {
                debug!(target = %target, "update addressed a superseded message, ignoring");
                false
            }
        }
    }

    fn settle_target(&mut self, target: &TargetId, error: Option<TargetError>) {
        let settled = {
            let Some(turn) = self.turn.as_mut() else {
                return;
            };
            turn.settle_target(target, error);
            turn.is_settled()
        };
        if settled {
            self.finish_turn();
        }
    }

    fn finish_turn(&mut self) {
        let Some(mut turn) = self.turn.take() else {
            return;
        };
        turn.phase = TurnPhase::Settling;
        if self.last_turn_error.is_some() {
            self.drop_empty_assistant_tail(&turn.assistant_message_id);
        }
        debug!(
            turn = turn.id,
            rate = ?turn.token_rate.tokens_per_second(),
            "turn settled"
        );
    }

    /// A turn that failed before producing anything leaves no placeholder
    /// behind.
    fn drop_empty_assistant_tail(&mut self, assistant_message_id: &str) {
        let drop = self
            .messages
            .last()
            .map(|message| {
                message.is_assistant()
                    && message.id == assistant_message_id
                    && message.is_empty_payload()
                    && message
                        .comparison_results
                        .values()
                        .all(ComparisonResult::is_empty_payload)
            })
            .unwrap_or(false);
        if drop {
            self.messages.pop();
        }
    }

    fn begin_turn(
        &mut self,
        user_message_id: String,
        comparisons: &[String],
    ) -> Result<Vec<EngineCommand>, SendError> {
        let mut assistant = Message::assistant_placeholder();
        for model in comparisons {
            assistant
                .comparison_results
                .insert(model.clone(), ComparisonResult::streaming());
        }
        let assistant_id = assistant.id.clone();
        self.messages.push(assistant);

        self.turn_seq += 1;
        self.turn = Some(Turn::new(self.turn_seq, user_message_id, assistant_id));

        let mut commands = Vec::with_capacity(comparisons.len() + 1);
        commands.push(self.dispatch_target(TargetId::Primary, true)?);
        for model in comparisons {
            commands.push(self.dispatch_target(TargetId::Comparison(model.clone()), true)?);
        }
        if let Some(turn) = self.turn.as_mut() {
            turn.phase = TurnPhase::Streaming;
        }
        Ok(commands)
    }

    fn dispatch_target(
        &mut self,
        target: TargetId,
        stream: bool,
    ) -> Result<EngineCommand, SendError> {
        let model_ref = match &target {
            TargetId::Primary => self.settings.model.clone(),
            TargetId::Comparison(key) => key.clone(),
        };
        let (provider_id, model) = self.resolve_model(&model_ref)?;

        let (conversation_id, parent_conversation_id) = match &target {
            TargetId::Primary => (self.conversation_id.clone(), None),
            TargetId::Comparison(key) => (
                self.linked_conversations.get(key).cloned(),
                self.conversation_id.clone(),
            ),
        };

        let (turn_id, cancel, request_id, user_message_id) = {
            let turn = self.turn.as_mut().ok_or(SendError::NoActiveTurn)?;
            let request_id = turn.register_target(target.clone());
            (
                turn.id,
                turn.cancel.clone(),
                request_id,
                turn.user_message_id.clone(),
            )
        };

        // The assistant placeholder is the last message; history never
        // includes it.
        let history_end = self.messages.len().saturating_sub(1);
        let source = &self.messages[..history_end];
        let mut history = build_history(
            source,
            target.comparison_key().unwrap_or_default(),
            target.is_primary(),
        );
        if let Some(user_index) = source
            .iter()
            .rposition(|message| message.id == user_message_id)
        {
            append_user_message(&mut history, outgoing_from_message(&source[user_index]));
        }

        let snapshot = DispatchSnapshot {
            provider_id,
            model,
            stream,
            conversation_id,
            parent_conversation_id,
            tools_enabled: self.settings.tools_enabled,
            tools: self.settings.tools.clone(),
            reasoning_effort: self.settings.reasoning_effort.clone(),
            system_prompt: self.settings.system_prompt.clone(),
        };
        let request = build_request(snapshot, history, request_id);

        debug!(target = %target, model = %request.model, stream, "dispatching request");
        Ok(EngineCommand::SpawnStream(StreamParams {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            request,
            cancel,
            key: StreamKey {
                turn_id,
                target,
            },
        }))
    }

    fn resolve_model(&self, model: &str) -> Result<(String, String), SendError> {
        if let Some((provider, actual)) = split_qualified(model) {
            return Ok((provider.to_string(), actual.to_string()));
        }
        match self.registry.provider_for(model) {
            Some(provider) => Ok((provider.to_string(), model.to_string())),
            None => Err(SendError::UnknownModel(model.to_string())),
        }
    }

    /// Two-phase dispatch support: make sure the parent conversation exists
    /// before fanning out. Returns the existing id or creates one.
    async fn ensure_conversation(&mut self) -> Result<String, SendError> {
        if let Some(id) = &self.conversation_id {
            return Ok(id.clone());
        }
        let meta = self.store.create(None).await?;
        debug!(conversation = %meta.id, "created conversation for parallel dispatch");
        self.conversation_title = meta.title.clone();
        self.conversation_id = Some(meta.id.clone());
        Ok(meta.id)
    }

    #[cfg(test)]
    pub fn stream_service(&self) -> ChatStreamService {
        self.stream.clone()
    }
}
