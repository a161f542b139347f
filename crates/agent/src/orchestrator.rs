//! The orchestrator: one inbound message in, one reply out.
//!
//! A turn moves through
//! `Idle → BuildingRequest → AwaitingModel → (ToolRoundTrip)* → Finalizing → Idle`.
//! Everything the turn produces (the user turn, intermediate tool calls and
//! their results, the final answer) is staged locally and committed to the
//! session only when the model answers. A failed or cancelled turn leaves
//! the history untouched.

use chrono::Utc;
use gemcord_config::{AppConfig, NamedPrompt};
use gemcord_core::channel::InboundEvent;
use gemcord_core::error::{Error, ModelError};
use gemcord_core::event::{DomainEvent, EventBus};
use gemcord_core::media::{MediaBlob, MediaRef};
use gemcord_core::memory::MemoryBank;
use gemcord_core::message::{ConversationId, ModelTurn, ToolResultTurn, Turn, UserTurn};
use gemcord_core::provider::{ModelReply, ModelRequest, ModelResponse, Provider, blocked_categories};
use gemcord_core::tool::{ToolCall, ToolOutcome, ToolRegistry};
use gemcord_media::{MediaResolver, extract_video_links, is_video_link, repair_link};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::SessionStore;

pub const EMPTY_PROMPT_NOTICE: &str = "You mentioned me, but you didn't give me any prompt!";
pub const RESET_NOTICE: &str = "Alright, I have cleared my context. What are we gonna talk about?";
pub const PERMISSION_DENIED_NOTICE: &str = "You don't have the necessary permissions for this!";
pub const NOTHING_TO_STOP_NOTICE: &str = "Nothing to stop.";
pub const TRUNCATION_SUFFIX: &str = "(Response May Be Cut Off)";
pub const INVALID_TOGGLE_NOTICE: &str = "Invalid toggle option specified.";

/// Toolsets selectable with `/toggle tools`, in index order.
pub const TOOLSETS: [&str; 2] = ["default", "none"];

/// Control commands. Stop acts immediately; the rest run in the
/// conversation's queue, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Cancel any running turn and clear the history
    Reset,
    /// Cancel the running turn
    Stop,
    /// Switch a per-conversation setting (owner only)
    Toggle(Toggle),
    /// Report the token count of the latest response
    Usage,
}

/// What `/toggle` switches. The index is 1-based; without one the next
/// option is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    SystemPrompt(Option<usize>),
    Model(Option<usize>),
    Tools(Option<usize>),
    Unknown,
}

impl Command {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        match text {
            "{clear}" | "/reset" => return Some(Self::Reset),
            "{stop}" | "/stop" => return Some(Self::Stop),
            "/usage" => return Some(Self::Usage),
            _ => {}
        }

        let mut words = text.split_whitespace();
        if words.next() != Some("/toggle") {
            return None;
        }
        let target = words.next();
        let index = match words.next().map(str::parse::<usize>) {
            None => None,
            Some(Ok(n)) => Some(n),
            Some(Err(_)) => return Some(Self::Toggle(Toggle::Unknown)),
        };
        if words.next().is_some() {
            return Some(Self::Toggle(Toggle::Unknown));
        }
        let toggle = match target {
            Some("sys") => Toggle::SystemPrompt(index),
            Some("model") => Toggle::Model(index),
            Some("tools") => Toggle::Tools(index),
            _ => Toggle::Unknown,
        };
        Some(Self::Toggle(toggle))
    }
}

/// Pick the option after `current`, or the 1-based `index` if given.
fn choose(current: Option<usize>, index: Option<usize>, count: usize) -> Result<usize, String> {
    match index {
        Some(n) if (1..=count).contains(&n) => Ok(n - 1),
        Some(_) => Err(format!(
            "Index out of bounds! Please use a number between 1 and {count}."
        )),
        None => Ok(current.map_or(0, |i| (i + 1) % count)),
    }
}

/// Where a turn currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    BuildingRequest,
    AwaitingModel,
    ToolRoundTrip,
    Finalizing,
}

/// What gets sent back to the conversation.
#[derive(Debug, Clone)]
pub struct Reply {
    pub text: String,
    pub media: Vec<MediaBlob>,
    /// The turn ended in an error and nothing was committed
    pub failed: bool,
}

impl Reply {
    pub fn answer(text: impl Into<String>, media: Vec<MediaBlob>) -> Self {
        Self {
            text: text.into(),
            media,
            failed: false,
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self::answer(text, Vec::new())
    }

    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media: Vec::new(),
            failed: true,
        }
    }
}

/// Drives turns for every conversation.
pub struct Orchestrator {
    /// The model backend
    provider: Arc<dyn Provider>,

    /// The model to request
    model: String,

    /// Tools offered to the model
    tools: Arc<ToolRegistry>,

    /// Turns attachments and video links into blobs
    media: Arc<MediaResolver>,

    /// Conversation histories
    sessions: Arc<SessionStore>,

    /// Event bus for domain events
    event_bus: Arc<EventBus>,

    system_prompt: String,

    temperature: f32,

    /// Configured bot owner; may always reset and reconfigure
    owner_id: Option<String>,

    /// Prompts selectable with `/toggle sys`
    system_prompts: Vec<NamedPrompt>,

    /// Models selectable with `/toggle model`
    models: Vec<String>,

    /// Long-term notes attached to the first turn of each conversation
    memory: Option<Arc<dyn MemoryBank>>,

    /// Tool round-trips allowed per turn
    max_tool_iterations: u32,

    /// Bound on each model round-trip
    model_timeout: Duration,

    /// Wait before the single retry of a failed model call
    retry_backoff: Duration,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
        media: Arc<MediaResolver>,
        sessions: Arc<SessionStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            tools,
            media,
            sessions,
            event_bus,
            system_prompt: String::new(),
            temperature: 1.0,
            owner_id: None,
            system_prompts: Vec::new(),
            models: Vec::new(),
            memory: None,
            max_tool_iterations: 5,
            model_timeout: Duration::from_secs(120),
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Build an orchestrator with every setting taken from the configuration.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        media: Arc<MediaResolver>,
        sessions: Arc<SessionStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let mut orchestrator = Self::new(provider, &config.model, tools, media, sessions, event_bus)
            .with_system_prompt(&config.system_prompt)
            .with_temperature(config.temperature)
            .with_system_prompts(config.system_prompts.clone())
            .with_models(config.models.clone())
            .with_max_tool_iterations(config.orchestrator.max_tool_iterations)
            .with_model_timeout(Duration::from_secs(config.orchestrator.model_timeout_secs))
            .with_retry_backoff(Duration::from_millis(config.orchestrator.retry_backoff_ms));
        if let Some(owner) = &config.owner_id {
            orchestrator = orchestrator.with_owner(owner);
        }
        orchestrator
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_system_prompts(mut self, prompts: Vec<NamedPrompt>) -> Self {
        self.system_prompts = prompts;
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryBank>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Set the maximum number of tool round-trips per turn.
    pub fn with_max_tool_iterations(mut self, max: u32) -> Self {
        self.max_tool_iterations = max;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Run one turn and produce exactly one reply, failures included.
    pub async fn handle(&self, event: InboundEvent) -> Reply {
        let id = event.conversation_id.clone();
        match self.process_turn(event).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(conversation_id = %id, error = %e, "Turn failed");
                self.event_bus.publish(DomainEvent::TurnFailed {
                    conversation_id: id.to_string(),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                Reply::failure(e.user_notice())
            }
        }
    }

    /// Run a control command. Returns `None` when the command needs no
    /// reply of its own (a stopped turn answers for itself).
    pub async fn handle_command(&self, event: &InboundEvent, command: Command) -> Option<Reply> {
        let id = &event.conversation_id;
        match command {
            Command::Reset => {
                if !self.may_configure(id, &event.author_id) {
                    info!(conversation_id = %id, author = %event.author_id, "Reset denied");
                    return Some(Reply::notice(PERMISSION_DENIED_NOTICE));
                }
                self.sessions.reset(id).await;
                Some(Reply::notice(RESET_NOTICE))
            }
            Command::Stop => {
                if self.sessions.cancel(id) {
                    None
                } else {
                    Some(Reply::notice(NOTHING_TO_STOP_NOTICE))
                }
            }
            Command::Toggle(toggle) => {
                if !self.may_configure(id, &event.author_id) {
                    info!(conversation_id = %id, author = %event.author_id, "Toggle denied");
                    return Some(Reply::notice(PERMISSION_DENIED_NOTICE));
                }
                Some(Reply::notice(self.toggle(id, toggle)))
            }
            Command::Usage => {
                let count = self.sessions.last_token_count(id).unwrap_or(0);
                Some(Reply::notice(format!("Total Token Count: {count}")))
            }
        }
    }

    fn toggle(&self, id: &ConversationId, toggle: Toggle) -> String {
        let metadata = self.sessions.metadata(id);
        let chosen = match toggle {
            Toggle::SystemPrompt(index) => {
                if self.system_prompts.is_empty() {
                    return "No system prompts available to switch to.".into();
                }
                let current = self.system_prompts.iter().position(|p| {
                    metadata.system_prompt_override.as_deref() == Some(p.prompt.as_str())
                });
                choose(current, index, self.system_prompts.len()).map(|i| {
                    let selected = &self.system_prompts[i];
                    self.sessions.update_metadata(id, |m| {
                        m.system_prompt_override = Some(selected.prompt.clone());
                    });
                    format!("Using system prompt: {}.", selected.name)
                })
            }
            Toggle::Model(index) => {
                if self.models.is_empty() {
                    return "No models available to switch to.".into();
                }
                let current = metadata
                    .model_override
                    .as_ref()
                    .and_then(|m| self.models.iter().position(|candidate| candidate == m));
                choose(current, index, self.models.len()).map(|i| {
                    let selected = &self.models[i];
                    self.sessions.update_metadata(id, |m| m.model_override = Some(selected.clone()));
                    format!("Switched to model: {selected}.")
                })
            }
            Toggle::Tools(index) => {
                let current = Some(usize::from(metadata.tools_disabled));
                choose(current, index, TOOLSETS.len()).map(|i| {
                    self.sessions.update_metadata(id, |m| m.tools_disabled = i == 1);
                    format!("Switched to toolset: {}.", TOOLSETS[i])
                })
            }
            Toggle::Unknown => return INVALID_TOGGLE_NOTICE.into(),
        };

        match chosen {
            Ok(notice) => {
                info!(conversation_id = %id, toggle = ?toggle, "{notice}");
                notice
            }
            Err(notice) => notice,
        }
    }

    /// Whether `author_id` may reset or reconfigure the conversation.
    ///
    /// Anyone may when neither a bot owner nor a conversation owner is set.
    pub fn may_configure(&self, id: &ConversationId, author_id: &str) -> bool {
        let session_owner = self.sessions.metadata(id).owner_id;
        if self.owner_id.is_none() && session_owner.is_none() {
            return true;
        }
        self.owner_id.as_deref() == Some(author_id) || session_owner.as_deref() == Some(author_id)
    }

    fn transition(&self, id: &ConversationId, state: TurnState) {
        debug!(conversation_id = %id, state = ?state, "Turn state");
    }

    /// Run one turn, returning the error that ended it if any.
    ///
    /// Waits for any earlier turn of the same conversation to finish first.
    pub async fn process_turn(&self, event: InboundEvent) -> Result<Reply, Error> {
        let id = event.conversation_id.clone();

        if event.text.trim().is_empty() && event.attachments.is_empty() && event.links.is_empty() {
            return Ok(Reply::notice(EMPTY_PROMPT_NOTICE));
        }

        self.event_bus.publish(DomainEvent::MessageReceived {
            conversation_id: id.to_string(),
            author_id: event.author_id.clone(),
            content_preview: event.text.chars().take(50).collect(),
            attachment_count: event.attachments.len(),
            timestamp: Utc::now(),
        });

        let mut session = self.sessions.lock(&id).await;
        let turn = self.sessions.begin_turn(&id);
        let cancel = turn.token().clone();
        let metadata = self.sessions.metadata(&id);
        self.transition(&id, TurnState::BuildingRequest);

        info!(
            conversation_id = %id,
            history = session.turns().len(),
            "Processing message"
        );

        // ── Media ──
        let (text, mut links) = extract_video_links(&event.text);
        for link in event.links.iter().filter(|l| is_video_link(l)) {
            let link = repair_link(link);
            if !links.contains(&link) {
                links.push(link);
            }
        }
        let mut references = event.attachments.clone();
        references.extend(links.into_iter().map(|url| MediaRef::VideoLink { url }));

        session.pending_uploads = references.len();
        let resolved = self.media.resolve_all(&references, &cancel).await;
        session.pending_uploads = 0;
        let media = resolved?;
        if !media.is_empty() {
            self.event_bus.publish(DomainEvent::MediaResolved {
                conversation_id: id.to_string(),
                blob_count: media.len(),
                total_bytes: media.iter().map(MediaBlob::len).sum(),
                timestamp: Utc::now(),
            });
        }

        let mut user = UserTurn::new(&event.author_id, text);
        user.author_name = event.author_name.clone();
        user.reply_context = event.reply_context.clone();
        user.media = media;

        let history = session.turns().to_vec();
        if history.is_empty() {
            user.memory = self.recall().await;
        }

        // ── Model round-trips ──
        let mut pending = vec![Turn::User(user)];
        let system_prompt = metadata
            .system_prompt_override
            .clone()
            .unwrap_or_else(|| self.system_prompt.clone());
        let model = metadata
            .model_override
            .clone()
            .unwrap_or_else(|| self.model.clone());
        let tool_definitions = if metadata.tools_disabled {
            Vec::new()
        } else {
            self.tools.definitions()
        };
        let mut round_trips = 0u32;
        let mut tokens_used: Option<u32> = None;
        let mut interim_text: Option<String> = None;

        loop {
            self.transition(&id, TurnState::AwaitingModel);
            let request = ModelRequest {
                model: model.clone(),
                system_prompt: (!system_prompt.is_empty()).then(|| system_prompt.clone()),
                history: history.clone(),
                new_turns: pending.clone(),
                tools: tool_definitions.clone(),
                safety_threshold: metadata.safety_threshold,
                temperature: self.temperature,
            };

            let response = self.call_model(&id, request.clone(), &cancel).await?;
            if let Some(usage) = response.usage {
                *tokens_used.get_or_insert(0) += usage.total_tokens;
                self.sessions.record_usage(&id, usage.total_tokens);
            }

            match response.reply {
                ModelReply::Blocked { ratings } => {
                    let categories = blocked_categories(&ratings, metadata.safety_threshold);
                    info!(conversation_id = %id, ?categories, "Response blocked");
                    return Err(ModelError::Blocked { categories }.into());
                }

                ModelReply::ToolCalls { text, calls } => {
                    if !text.trim().is_empty() {
                        interim_text = Some(text.trim().to_string());
                    }
                    if round_trips >= self.max_tool_iterations {
                        warn!(
                            conversation_id = %id,
                            cap = self.max_tool_iterations,
                            "Tool loop cap reached"
                        );
                        let partial = self
                            .answer_without_tools(&id, request, &cancel)
                            .await?
                            .or(interim_text);
                        return Err(Error::ToolLoopExceeded {
                            cap: self.max_tool_iterations,
                            partial,
                        });
                    }
                    round_trips += 1;
                    self.transition(&id, TurnState::ToolRoundTrip);
                    debug!(
                        conversation_id = %id,
                        hop = round_trips,
                        tool_count = calls.len(),
                        "Executing tool calls"
                    );

                    pending.push(Turn::Model(ModelTurn::with_calls(text, calls.clone())));
                    for call in &calls {
                        let outcome = self.invoke_tool(&id, call, &cancel).await?;
                        pending.push(Turn::ToolResult(ToolResultTurn::new(call, outcome)));
                    }
                }

                ModelReply::Final { text, media, truncated } => {
                    self.transition(&id, TurnState::Finalizing);
                    let mut text = text.trim().to_string();
                    if truncated {
                        text = format!("{text}\n\n{TRUNCATION_SUFFIX}");
                    }
                    if text.is_empty() && media.is_empty() {
                        return Err(Error::Internal("the model returned an empty answer".into()));
                    }
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }

                    pending.push(Turn::Model(ModelTurn::answer(text.clone(), media.clone())));
                    session.append(pending, self.sessions.max_turns());

                    self.event_bus.publish(DomainEvent::ResponseGenerated {
                        conversation_id: id.to_string(),
                        model: response.model,
                        tool_round_trips: round_trips,
                        tokens_used,
                        timestamp: Utc::now(),
                    });
                    self.transition(&id, TurnState::Idle);
                    return Ok(Reply::answer(text, media));
                }
            }
        }
    }

    /// Saved notes, if any. Memory trouble never fails the turn.
    async fn recall(&self) -> Option<String> {
        let memory = self.memory.as_ref()?;
        match memory.load().await {
            Ok(notes) if !notes.trim().is_empty() => Some(notes),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Failed to load memory");
                None
            }
        }
    }

    /// Ask once more with tools withheld, for a best-effort answer after the
    /// tool loop cap. Only cancellation is an error here.
    async fn answer_without_tools(
        &self,
        id: &ConversationId,
        request: ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, Error> {
        let request = ModelRequest {
            tools: Vec::new(),
            ..request
        };
        match self.call_model(id, request, cancel).await {
            Ok(ModelResponse {
                reply: ModelReply::Final { text, .. },
                usage,
                ..
            }) => {
                if let Some(usage) = usage {
                    self.sessions.record_usage(id, usage.total_tokens);
                }
                let text = text.trim();
                Ok((!text.is_empty()).then(|| text.to_string()))
            }
            Ok(_) => Ok(None),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                warn!(conversation_id = %id, error = %e, "Answer without tools failed");
                Ok(None)
            }
        }
    }

    /// One model round-trip under the timeout, retried once on transport failure.
    async fn call_model(
        &self,
        id: &ConversationId,
        request: ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, Error> {
        let mut attempt = 1;
        loop {
            let call = tokio::time::timeout(self.model_timeout, self.provider.complete(request.clone()));
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = call => result.unwrap_or(Err(ModelError::Timeout {
                    timeout_secs: self.model_timeout.as_secs(),
                })),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if attempt == 1 && e.is_retryable() => {
                    warn!(conversation_id = %id, error = %e, "Model call failed, retrying");
                    attempt += 1;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run one tool call. Tool failures become failure results for the
    /// model; only cancellation ends the turn.
    async fn invoke_tool(
        &self,
        id: &ConversationId,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome, Error> {
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.tools.invoke(&call.name, &call.arguments) => result,
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        if let Err(e) = &result {
            warn!(conversation_id = %id, tool = %call.name, error = %e, "Tool call failed");
        }
        self.event_bus.publish(DomainEvent::ToolExecuted {
            conversation_id: id.to_string(),
            tool_name: call.name.clone(),
            success: result.is_ok(),
            duration_ms,
            timestamp: Utc::now(),
        });

        Ok(ToolOutcome::from(result))
    }
}
