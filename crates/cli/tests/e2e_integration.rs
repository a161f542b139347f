//! End-to-end integration tests for the gemcord chat pipeline.
//!
//! These tests run the real tool registry, media resolver, session store,
//! orchestrator, chunker and dispatcher against a scripted model and an
//! in-memory chat channel.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gemcord_agent::{Dispatcher, Orchestrator, SessionMetadata, SessionStore};
use gemcord_config::AppConfig;
use gemcord_core::channel::{Channel, InboundEvent, OutboundMessage, OutboundPayload};
use gemcord_core::error::{ChannelError, ModelError};
use gemcord_core::event::{DomainEvent, EventBus};
use gemcord_core::memory::MemoryBank;
use gemcord_core::media::MediaRef;
use gemcord_core::message::{ConversationId, Turn};
use gemcord_core::provider::{
    HarmBlockThreshold, HarmCategory, HarmProbability, ModelReply, ModelRequest, ModelResponse,
    Provider, SafetyRating, Usage,
};
use gemcord_core::tool::{ToolCall, ToolOutcome};
use gemcord_media::MediaResolver;
use gemcord_tools::{FileMemory, default_registry};
use tokio::sync::mpsc;

// ── Mock Provider ────────────────────────────────────────────────────────

type Script = Box<dyn Fn(&ModelRequest) -> ModelReply + Send + Sync>;

/// A mock provider whose reply is computed from each request.
struct ScriptedProvider {
    script: Script,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedProvider {
    fn new(script: impl Fn(&ModelRequest) -> ModelReply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let reply = (self.script)(&request);
        self.requests.lock().unwrap().push(request);
        Ok(ModelResponse {
            reply,
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model: "e2e-model".into(),
        })
    }
}

fn final_text(text: impl Into<String>) -> ModelReply {
    ModelReply::Final {
        text: text.into(),
        media: vec![],
        truncated: false,
    }
}

fn math_call(expression: &str) -> ModelReply {
    ModelReply::ToolCalls {
        text: String::new(),
        calls: vec![ToolCall {
            id: "call_math".into(),
            name: "symbolic_math".into(),
            arguments: serde_json::json!({ "expression": expression }),
        }],
    }
}

/// The newest tool result the model has been shown, if any.
fn last_tool_result(request: &ModelRequest) -> Option<&ToolOutcome> {
    request.new_turns.iter().rev().find_map(|turn| match turn {
        Turn::ToolResult(result) => Some(&result.outcome),
        _ => None,
    })
}

// ── Recording Channel ───────────────────────────────────────────────────

/// Feeds fixed inbound events, then closes; records every outbound message.
struct RecordingChannel {
    inbound: Mutex<Option<mpsc::Receiver<Result<InboundEvent, ChannelError>>>>,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingChannel {
    fn new(events: Vec<InboundEvent>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.try_send(Ok(event)).unwrap();
        }
        Arc::new(Self {
            inbound: Mutex::new(Some(rx)),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| m.text().map(String::from))
            .collect()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn start(
        &self,
    ) -> Result<mpsc::Receiver<Result<InboundEvent, ChannelError>>, ChannelError> {
        self.inbound
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ChannelError::NotConfigured("started twice".into()))
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn is_allowed(&self, _author_id: &str) -> bool {
        true
    }
}

// ── Wiring ──────────────────────────────────────────────────────────────

struct Bot {
    orchestrator: Arc<Orchestrator>,
    sessions: Arc<SessionStore>,
    events: Arc<EventBus>,
    max_message_length: usize,
}

fn bot(config: &AppConfig, provider: Arc<dyn Provider>) -> Bot {
    bot_with_memory(config, provider, None)
}

fn bot_with_memory(
    config: &AppConfig,
    provider: Arc<dyn Provider>,
    memory: Option<Arc<dyn MemoryBank>>,
) -> Bot {
    let sessions = Arc::new(SessionStore::new(
        config.session.max_turns,
        SessionMetadata::from_config(config),
    ));
    let events = Arc::new(EventBus::default());
    let mut orchestrator = Orchestrator::from_config(
        config,
        provider,
        Arc::new(default_registry(&config.tools, memory.clone())),
        Arc::new(MediaResolver::from_config(&config.media)),
        sessions.clone(),
        events.clone(),
    );
    if let Some(memory) = memory {
        orchestrator = orchestrator.with_memory(memory);
    }
    let orchestrator = Arc::new(orchestrator);
    Bot {
        orchestrator,
        sessions,
        events,
        max_message_length: config.reply.max_message_length,
    }
}

async fn serve(bot: &Bot, events: Vec<InboundEvent>) -> Arc<RecordingChannel> {
    let channel = RecordingChannel::new(events);
    let dispatcher = Arc::new(
        Dispatcher::new(bot.orchestrator.clone(), channel.clone())
            .with_max_message_length(bot.max_message_length),
    );
    dispatcher.run().await.unwrap();
    channel
}

fn message(conversation: &str, text: &str) -> InboundEvent {
    let mut event = InboundEvent::new(ConversationId::from(conversation), "user-1", text);
    event.author_name = Some("alice".into());
    event
}

// ── E2E: Tool round-trip ────────────────────────────────────────────────

#[tokio::test]
async fn e2e_symbolic_math_round_trip_sends_one_message() {
    let provider = ScriptedProvider::new(|request| match last_tool_result(request) {
        None => math_call("12*7"),
        Some(ToolOutcome::Success(payload)) => final_text(format!("12 * 7 = {}", payload["result"])),
        Some(ToolOutcome::Failure(reason)) => final_text(format!("failed: {reason}")),
    });
    let bot = bot(&AppConfig::default(), provider.clone());

    let channel = serve(&bot, vec![message("chan-1", "What is 12*7?")]).await;

    // Exactly one outbound message, carrying the answer.
    let texts = channel.texts();
    assert_eq!(texts, vec!["12 * 7 = 84"]);
    assert_eq!(provider.calls(), 2);

    // The model was offered both built-in tools.
    let requests = provider.requests.lock().unwrap();
    let tool_names: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(tool_names, vec!["symbolic_math", "web_search"]);

    // History: user, tool call, tool result {84}, final answer.
    let history = bot.sessions.history(&ConversationId::from("chan-1")).await;
    assert_eq!(history.len(), 4);
    match &history[1] {
        Turn::Model(model) => {
            assert_eq!(model.tool_calls[0].name, "symbolic_math");
            assert_eq!(model.tool_calls[0].arguments, serde_json::json!({"expression": "12*7"}));
        }
        other => panic!("expected tool call turn, got {other:?}"),
    }
    match &history[2] {
        Turn::ToolResult(result) => match &result.outcome {
            ToolOutcome::Success(payload) => assert_eq!(payload["result"], 84),
            other => panic!("tool failed: {other:?}"),
        },
        other => panic!("expected tool result turn, got {other:?}"),
    }
    match &history[3] {
        Turn::Model(model) => assert!(model.text.contains("84")),
        other => panic!("expected final answer, got {other:?}"),
    }
}

#[tokio::test]
async fn e2e_user_turn_carries_author_prefix() {
    let provider = ScriptedProvider::new(|_| final_text("hi alice"));
    let bot = bot(&AppConfig::default(), provider.clone());
    serve(&bot, vec![message("chan-1", "hello")]).await;

    let requests = provider.requests.lock().unwrap();
    match &requests[0].new_turns[0] {
        Turn::User(user) => {
            let prompt = user.prompt_text();
            assert!(prompt.contains("alice with ID user-1: hello"), "{prompt}");
        }
        other => panic!("expected user turn, got {other:?}"),
    }
    assert!(requests[0].system_prompt.is_some());
}

// ── E2E: Tool loop cap ──────────────────────────────────────────────────

#[tokio::test]
async fn e2e_runaway_tool_loop_is_capped() {
    let provider = ScriptedProvider::new(|_| math_call("1+1"));
    let mut config = AppConfig::default();
    config.orchestrator.max_tool_iterations = 3;
    let bot = bot(&config, provider.clone());
    let mut failures = bot.events.subscribe();

    let channel = serve(&bot, vec![message("chan-1", "loop please")]).await;

    // Three round-trips, the request for a fourth, then one without tools.
    assert_eq!(provider.calls(), 5);
    let texts = channel.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("3 tool calls"), "{}", texts[0]);
    assert!(bot.sessions.history(&ConversationId::from("chan-1")).await.is_empty());

    let mut saw_failure = false;
    while let Ok(event) = failures.try_recv() {
        if matches!(event.as_ref(), DomainEvent::TurnFailed { .. }) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn e2e_capped_tool_loop_delivers_best_effort_answer() {
    let provider = ScriptedProvider::new(|request| {
        if request.tools.is_empty() {
            final_text("It is probably 2.")
        } else {
            math_call("1+1")
        }
    });
    let mut config = AppConfig::default();
    config.orchestrator.max_tool_iterations = 3;
    let bot = bot(&config, provider.clone());

    let channel = serve(&bot, vec![message("chan-1", "loop please")]).await;

    let texts = channel.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("It is probably 2."), "{}", texts[0]);
    assert!(texts[0].contains("3 tool calls"), "{}", texts[0]);
    assert!(bot.sessions.history(&ConversationId::from("chan-1")).await.is_empty());
}

// ── E2E: Memory ─────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_saved_memory_reaches_the_next_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let memory: Arc<dyn MemoryBank> = Arc::new(FileMemory::new(dir.path().join("memory.txt")));
    let provider = ScriptedProvider::new(|request| {
        let first_text = match &request.new_turns[0] {
            Turn::User(user) => user.text.clone(),
            _ => String::new(),
        };
        if first_text == "remember that I like tea" && last_tool_result(request).is_none() {
            ModelReply::ToolCalls {
                text: String::new(),
                calls: vec![ToolCall {
                    id: "call_memory".into(),
                    name: "save_memory".into(),
                    arguments: serde_json::json!({"msg": "alice likes tea"}),
                }],
            }
        } else {
            final_text("Noted.")
        }
    });
    let bot = bot_with_memory(&AppConfig::default(), provider.clone(), Some(memory.clone()));

    serve(&bot, vec![message("chan-1", "remember that I like tea")]).await;
    assert_eq!(memory.load().await.unwrap(), "alice likes tea");

    serve(&bot, vec![message("chan-2", "what do I like?")]).await;
    let requests = provider.requests.lock().unwrap();
    let last = requests.last().unwrap();
    match &last.new_turns[0] {
        Turn::User(user) => {
            let prompt = user.prompt_text();
            assert!(
                prompt.starts_with("This is the memory you saved: alice likes tea"),
                "{prompt}"
            );
        }
        other => panic!("expected user turn, got {other:?}"),
    }
    let tool_names: Vec<&str> = last.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(tool_names, vec!["save_memory", "symbolic_math", "web_search"]);
}

// ── E2E: Owner toggles ──────────────────────────────────────────────────

#[tokio::test]
async fn e2e_owner_toggles_apply_to_later_turns() {
    let provider = ScriptedProvider::new(|_| final_text("ok"));
    let mut config = AppConfig::default();
    config.owner_id = Some("user-1".into());
    config.models = vec!["gemini-2.5-flash".into(), "gemini-2.5-pro".into()];
    let bot = bot(&config, provider.clone());

    let mut stranger = InboundEvent::new(ConversationId::from("chan-1"), "user-2", "/toggle tools");
    stranger.author_name = Some("mallory".into());
    let channel = serve(
        &bot,
        vec![
            stranger,
            message("chan-1", "/toggle model 2"),
            message("chan-1", "/toggle tools"),
            message("chan-1", "hello"),
        ],
    )
    .await;

    assert_eq!(
        channel.texts(),
        vec![
            "You don't have the necessary permissions for this!",
            "Switched to model: gemini-2.5-pro.",
            "Switched to toolset: none.",
            "ok",
        ]
    );
    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].model, "gemini-2.5-pro");
    assert!(requests[0].tools.is_empty());
}

// ── E2E: Harm-block threshold ───────────────────────────────────────────

/// Rates every answer as low-probability harassment and lets the request's
/// threshold decide, the way the model API does.
fn safety_aware_provider() -> Arc<ScriptedProvider> {
    ScriptedProvider::new(|request| {
        let rating = SafetyRating {
            category: HarmCategory::Harassment,
            probability: HarmProbability::Low,
        };
        if request.safety_threshold.blocks(rating.probability) {
            ModelReply::Blocked {
                ratings: vec![rating],
            }
        } else {
            final_text("a mildly rude joke")
        }
    })
}

#[tokio::test]
async fn e2e_block_none_delivers_unfiltered() {
    let config = AppConfig::from_toml_str("harm_block_threshold = \"BLOCK_NONE\"").unwrap();
    let bot = bot(&config, safety_aware_provider());

    let channel = serve(&bot, vec![message("chan-1", "tell me a rude joke")]).await;
    assert_eq!(channel.texts(), vec!["a mildly rude joke"]);
}

#[tokio::test]
async fn e2e_block_low_and_above_blocks() {
    let config =
        AppConfig::from_toml_str("harm_block_threshold = \"BLOCK_LOW_AND_ABOVE\"").unwrap();
    assert_eq!(config.harm_block_threshold, HarmBlockThreshold::BlockLowAndAbove);
    let provider = safety_aware_provider();
    let bot = bot(&config, provider.clone());

    let channel = serve(&bot, vec![message("chan-1", "tell me a rude joke")]).await;
    assert_eq!(channel.texts(), vec!["This response was blocked due to Harassment"]);
    // Blocked is terminal: no retry.
    assert_eq!(provider.calls(), 1);
    assert!(bot.sessions.history(&ConversationId::from("chan-1")).await.is_empty());
}

// ── E2E: Media resolution failure ───────────────────────────────────────

#[tokio::test]
async fn e2e_download_failure_commits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("cat.png");
    std::fs::write(&present, [0x89, b'P', b'N', b'G', 0x0d, 0x0a]).unwrap();
    let missing = dir.path().join("missing.png");

    let provider = ScriptedProvider::new(|_| final_text("unreachable"));
    let bot = bot(&AppConfig::default(), provider.clone());

    let mut event = message("chan-1", "compare these");
    for path in [&present, &missing] {
        event.attachments.push(MediaRef::Attachment {
            url: format!("file://{}", path.display()),
            filename: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            mime_type: None,
            size_bytes: None,
        });
    }

    let channel = serve(&bot, vec![event]).await;

    assert_eq!(provider.calls(), 0);
    let texts = channel.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("Error: Failed to fetch attachment(s)."), "{}", texts[0]);
    assert!(bot.sessions.history(&ConversationId::from("chan-1")).await.is_empty());
}

#[tokio::test]
async fn e2e_local_attachment_reaches_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "remember the milk").unwrap();

    let provider = ScriptedProvider::new(|_| final_text("You should buy milk."));
    let bot = bot(&AppConfig::default(), provider.clone());
    let mut event = message("chan-1", "what do my notes say?");
    event.attachments.push(MediaRef::Attachment {
        url: format!("file://{}", path.display()),
        filename: Some("notes.txt".into()),
        mime_type: None,
        size_bytes: Some(17),
    });

    let channel = serve(&bot, vec![event]).await;
    assert_eq!(channel.texts(), vec!["You should buy milk."]);

    let requests = provider.requests.lock().unwrap();
    match &requests[0].new_turns[0] {
        Turn::User(user) => {
            assert_eq!(user.media.len(), 1);
            assert_eq!(user.media[0].mime_type(), "text/plain");
            assert_eq!(user.media[0].data(), b"remember the milk");
        }
        other => panic!("expected user turn, got {other:?}"),
    }
}

// ── E2E: Concurrency ────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_conversations_stay_ordered() {
    let provider = ScriptedProvider::new(|request| {
        let text = request
            .new_turns
            .iter()
            .find_map(|t| match t {
                Turn::User(u) => Some(u.text.clone()),
                _ => None,
            })
            .unwrap_or_default();
        final_text(format!("ack {text}"))
    });
    let bot = bot(&AppConfig::default(), provider);

    let mut events = Vec::new();
    for i in 0..5 {
        events.push(message("left", &format!("L{i}")));
        events.push(message("right", &format!("R{i}")));
    }
    let channel = serve(&bot, events).await;

    let sent = channel.sent.lock().unwrap();
    let for_conversation = |id: &str| -> Vec<String> {
        sent.iter()
            .filter(|m| m.conversation_id.as_str() == id)
            .filter_map(|m| match &m.payload {
                OutboundPayload::Text(t) => Some(t.clone()),
                OutboundPayload::Media(_) => None,
            })
            .collect()
    };
    assert_eq!(
        for_conversation("left"),
        (0..5).map(|i| format!("ack L{i}")).collect::<Vec<_>>()
    );
    assert_eq!(
        for_conversation("right"),
        (0..5).map(|i| format!("ack R{i}")).collect::<Vec<_>>()
    );

    // Each session holds its own exchanges, in arrival order.
    let left = bot.sessions.history(&ConversationId::from("left")).await;
    assert_eq!(left.len(), 10);
    assert!(left.iter().step_by(2).all(Turn::is_user));
}

// ── E2E: Commands ───────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_owner_only_reset() {
    let provider = ScriptedProvider::new(|_| final_text("noted"));
    let mut config = AppConfig::default();
    config.owner_id = Some("owner-1".into());
    let bot = bot(&config, provider);

    serve(&bot, vec![message("chan-1", "remember this")]).await;
    let channel = serve(&bot, vec![message("chan-1", "{clear}")]).await;
    assert_eq!(
        channel.texts(),
        vec!["You don't have the necessary permissions for this!"]
    );
    assert_eq!(bot.sessions.history(&ConversationId::from("chan-1")).await.len(), 2);

    let owner_clear = InboundEvent::new(ConversationId::from("chan-1"), "owner-1", "{clear}");
    let channel = serve(&bot, vec![owner_clear]).await;
    assert_eq!(
        channel.texts(),
        vec!["Alright, I have cleared my context. What are we gonna talk about?"]
    );
    assert!(bot.sessions.history(&ConversationId::from("chan-1")).await.is_empty());
}

#[tokio::test]
async fn e2e_empty_mention_gets_a_prompt_notice() {
    let provider = ScriptedProvider::new(|_| final_text("unreachable"));
    let bot = bot(&AppConfig::default(), provider.clone());
    let channel = serve(&bot, vec![message("chan-1", "")]).await;
    assert_eq!(
        channel.texts(),
        vec!["You mentioned me, but you didn't give me any prompt!"]
    );
    assert_eq!(provider.calls(), 0);
}
