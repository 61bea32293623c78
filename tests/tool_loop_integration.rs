//! Integration tests for the conversation engine: the tool-call loop,
//! per-append persistence, trimming, and failure handling — driven by a
//! scripted provider, with real reminder plumbing underneath.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chime::comm::{self, ChannelConnector, Outbound};
use chime::engine::{ConversationEngine, TrimPolicy};
use chime::history::{History, HistoryStore, Message};
use chime::models::{
    ChatMessage, ImageGenerator, ModelProvider, ProviderResponse, TokenUsage, ToolCallItem,
};
use chime::reminders::ReminderService;
use chime::scheduler::store::{JobStore, Trigger};
use chime::scheduler::JobRuntime;
use chime::tools::ToolDispatcher;
use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;

const TZ: chrono_tz::Tz = chrono_tz::America::Los_Angeles;

// ── Scripted provider ────────────────────────────────────────

enum Step {
    Reply(ProviderResponse, Option<TokenUsage>),
    Fail(String),
}

fn usage(total: u64) -> Option<TokenUsage> {
    Some(TokenUsage {
        prompt_tokens: total,
        completion_tokens: 0,
        total_tokens: total,
    })
}

fn tool_call(id: &str, name: &str, arguments: Value) -> ToolCallItem {
    ToolCallItem {
        id: id.into(),
        name: name.into(),
        arguments: arguments.to_string(),
    }
}

/// Shape of one provider invocation, recorded for assertions.
#[derive(Debug, Clone)]
struct CallShape {
    roles: Vec<String>,
    had_tools: bool,
}

struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<CallShape>>,
}

impl ScriptedProvider {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<CallShape> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn send_chat_with_functions(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> anyhow::Result<(ProviderResponse, Option<TokenUsage>)> {
        self.calls.lock().unwrap().push(CallShape {
            roles: messages.iter().map(|m| m.role.clone()).collect(),
            had_tools: !tools.is_empty(),
        });
        match self.steps.lock().unwrap().pop_front() {
            Some(Step::Reply(response, usage)) => Ok((response, usage)),
            Some(Step::Fail(message)) => Err(anyhow::anyhow!(message)),
            None => Ok((ProviderResponse::Final("out of script".into()), None)),
        }
    }
}

struct StubImages;

#[async_trait]
impl ImageGenerator for StubImages {
    async fn generate_image(&self, _prompt: &str) -> anyhow::Result<String> {
        Ok("https://example.com/generated.png".into())
    }
}

// ── Capturing connector ──────────────────────────────────────

struct CaptureConnector {
    name: String,
    chat_id: i64,
    captured: Arc<Mutex<Vec<Outbound>>>,
}

#[async_trait]
impl ChannelConnector for CaptureConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, chat_id: i64) -> bool {
        chat_id == self.chat_id
    }

    async fn deliver(&self, _chat_id: i64, payload: Outbound) -> anyhow::Result<()> {
        self.captured.lock().unwrap().push(payload);
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────

struct Harness {
    _dir: TempDir,
    chat_id: i64,
    engine: Arc<ConversationEngine>,
    provider: Arc<ScriptedProvider>,
    job_store: Arc<JobStore>,
    runtime: Arc<JobRuntime>,
    history_dir: std::path::PathBuf,
    captured: Arc<Mutex<Vec<Outbound>>>,
}

impl Harness {
    async fn new(chat_id: i64, steps: Vec<Step>, trim: TrimPolicy) -> Self {
        let dir = TempDir::new().unwrap();
        let history_dir = dir.path().join("history");

        let job_store = Arc::new(JobStore::open(&dir.path().join("jobs.db")).unwrap());
        let runtime = JobRuntime::start(job_store.clone(), TZ).await.unwrap();
        let reminders = ReminderService::new(runtime.clone(), job_store.clone());

        let provider = ScriptedProvider::new(steps);
        let dispatcher = ToolDispatcher::new(reminders, None, Arc::new(StubImages));

        let engine = ConversationEngine::new(
            provider.clone(),
            dispatcher,
            Arc::new(chime::speech::NullSynthesizer),
            "You are a test assistant.".into(),
            history_dir.clone(),
            trim,
        );

        let captured = Arc::new(Mutex::new(Vec::new()));
        comm::register_connector(Arc::new(CaptureConnector {
            name: format!("capture-{chat_id}"),
            chat_id,
            captured: captured.clone(),
        }))
        .await;

        Self {
            _dir: dir,
            chat_id,
            engine,
            provider,
            job_store,
            runtime,
            history_dir,
            captured,
        }
    }

    async fn persisted_history(&self) -> Vec<Message> {
        HistoryStore::new(&self.history_dir, self.chat_id)
            .load()
            .await
            .unwrap()
    }

    fn texts(&self) -> Vec<String> {
        self.captured
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| match p {
                Outbound::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn plain_reply_is_delivered_and_persisted() {
    let h = Harness::new(
        201,
        vec![Step::Reply(
            ProviderResponse::Final("Hello there.".into()),
            usage(50),
        )],
        TrimPolicy::default(),
    )
    .await;

    h.engine.send(h.chat_id, "hi").await.unwrap();

    assert_eq!(h.texts(), vec!["Hello there.".to_string()]);

    let history = h.persisted_history().await;
    assert_eq!(
        history,
        vec![
            Message::User("hi".into()),
            Message::AssistantText("Hello there.".into()),
        ]
    );

    let calls = h.provider.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].had_tools);
    assert_eq!(calls[0].roles[0], "system");

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn tool_loop_creates_timer_and_keeps_history_paired() {
    let h = Harness::new(
        202,
        vec![
            Step::Reply(
                ProviderResponse::ToolCalls(vec![tool_call(
                    "call_1",
                    "create_timer",
                    serde_json::json!({"name": "tea", "time": 5, "description": ""}),
                )]),
                usage(100),
            ),
            Step::Reply(
                ProviderResponse::Final("Your tea timer is set.".into()),
                usage(120),
            ),
        ],
        TrimPolicy::default(),
    )
    .await;

    h.engine
        .send(h.chat_id, "set a timer for 5 minutes called tea")
        .await
        .unwrap();

    // One scheduled job, due at now + 300s.
    let jobs = h.job_store.load_all().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name, "timer:tea");
    match &jobs[0].trigger {
        Trigger::At(fire_at) => {
            let offset = (*fire_at - Utc::now()).num_seconds();
            assert!((295..=305).contains(&offset), "unexpected offset {offset}");
        }
        other => panic!("expected one-shot trigger, got {other:?}"),
    }

    // History sequence: user → tool calls → tool result → final text.
    let history = h.persisted_history().await;
    assert_eq!(history.len(), 4);
    assert!(matches!(history[0], Message::User(_)));
    match &history[1] {
        Message::AssistantToolCalls(calls) => {
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].id, "call_1");
        }
        other => panic!("expected tool calls, got {other:?}"),
    }
    match &history[2] {
        Message::ToolResult {
            call_id, content, ..
        } => {
            assert_eq!(call_id, "call_1");
            assert!(content.contains("Timer set successfully"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
    assert_eq!(
        history[3],
        Message::AssistantText("Your tea timer is set.".into())
    );
    assert!(History::from_messages(history).check_pairing().is_ok());

    // Second model call happened without the tool schema, over a history
    // that includes the tool result.
    let calls = h.provider.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].had_tools);
    assert!(!calls[1].had_tools);
    assert!(calls[1].roles.contains(&"tool".to_string()));

    // Platform confirmation carried the cancel affordance.
    let cancel_buttons: Vec<String> = h
        .captured
        .lock()
        .unwrap()
        .iter()
        .filter_map(|p| match p {
            Outbound::TextWithCancel { job_name, .. } => Some(job_name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(cancel_buttons, vec!["timer:tea".to_string()]);
    assert!(h.texts().contains(&"Your tea timer is set.".to_string()));

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn multiple_tool_calls_dispatch_in_order() {
    let h = Harness::new(
        203,
        vec![
            Step::Reply(
                ProviderResponse::ToolCalls(vec![
                    tool_call(
                        "call_a",
                        "create_timer",
                        serde_json::json!({"name": "tea", "time": 5, "description": ""}),
                    ),
                    tool_call(
                        "call_b",
                        "create_timer",
                        serde_json::json!({"name": "coffee", "time": 7, "description": ""}),
                    ),
                ]),
                None,
            ),
            Step::Reply(ProviderResponse::Final("Both timers set.".into()), None),
        ],
        TrimPolicy::default(),
    )
    .await;

    h.engine.send(h.chat_id, "tea and coffee timers").await.unwrap();

    let history = h.persisted_history().await;
    let result_ids: Vec<&str> = history
        .iter()
        .filter_map(|m| match m {
            Message::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(result_ids, vec!["call_a", "call_b"]);

    let mut names: Vec<String> = h
        .job_store
        .load_all()
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["timer:coffee".to_string(), "timer:tea".to_string()]);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn invalid_tool_arguments_feed_syntax_back_to_model() {
    let h = Harness::new(
        204,
        vec![
            Step::Reply(
                ProviderResponse::ToolCalls(vec![tool_call(
                    "call_1",
                    "create_alarm",
                    serde_json::json!({"name": "wake", "time": "25:99", "description": ""}),
                )]),
                None,
            ),
            Step::Reply(ProviderResponse::Final("That time looks wrong.".into()), None),
        ],
        TrimPolicy::default(),
    )
    .await;

    h.engine.send(h.chat_id, "alarm at 25:99").await.unwrap();

    // No job created; the validation text became the tool result.
    assert!(h.job_store.load_all().unwrap().is_empty());
    let history = h.persisted_history().await;
    match &history[2] {
        Message::ToolResult { content, .. } => {
            assert!(content.contains("4-digit 24-hour"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn unknown_tool_name_aborts_the_turn() {
    let h = Harness::new(
        205,
        vec![Step::Reply(
            ProviderResponse::ToolCalls(vec![tool_call("call_1", "exec_shell", serde_json::json!({}))]),
            None,
        )],
        TrimPolicy::default(),
    )
    .await;

    let err = h.engine.send(h.chat_id, "do something odd").await.unwrap_err();
    assert!(err.to_string().contains("contract violation"));

    // The tool-call message was already recorded; no result follows it.
    let history = h.persisted_history().await;
    assert_eq!(history.len(), 2);
    assert!(matches!(history[1], Message::AssistantToolCalls(_)));

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn transient_model_failure_keeps_persisted_prefix() {
    let h = Harness::new(
        206,
        vec![Step::Fail("OpenAI API returned 500 Internal Server Error: oops".into())],
        TrimPolicy::default(),
    )
    .await;

    assert!(h.engine.send(h.chat_id, "hello?").await.is_err());

    // The user message stays persisted; the user got a generic apology.
    assert_eq!(
        h.persisted_history().await,
        vec![Message::User("hello?".into())]
    );
    let texts = h.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("Sorry"));

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn empty_model_response_delivers_nothing() {
    let h = Harness::new(
        207,
        vec![Step::Reply(ProviderResponse::Final(String::new()), None)],
        TrimPolicy::default(),
    )
    .await;

    h.engine.send(h.chat_id, "hm").await.unwrap();

    assert!(h.texts().is_empty());
    assert_eq!(h.persisted_history().await, vec![Message::User("hm".into())]);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn usage_over_threshold_trims_oldest_entries() {
    let h = Harness::new(
        208,
        vec![
            Step::Reply(ProviderResponse::Final("first".into()), usage(10)),
            Step::Reply(ProviderResponse::Final("second".into()), usage(10)),
        ],
        TrimPolicy {
            token_threshold: 1,
            trim_fraction: 0.5,
        },
    )
    .await;

    // Turn 1: history [user] at call time — floor(1 * 0.5) = 0, no trim.
    h.engine.send(h.chat_id, "one").await.unwrap();
    assert_eq!(h.persisted_history().await.len(), 2);

    // Turn 2: history [user, assistant, user] at call time —
    // floor(3 * 0.5) = 1, the oldest user message goes.
    h.engine.send(h.chat_id, "two").await.unwrap();
    let history = h.persisted_history().await;
    assert_eq!(
        history,
        vec![
            Message::AssistantText("first".into()),
            Message::User("two".into()),
            Message::AssistantText("second".into()),
        ]
    );

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn fired_job_event_flows_through_engine_to_user() {
    // End to end: a short timer fires, the dispatcher feeds the synthetic
    // event into the engine, and the user gets a model-phrased
    // notification referencing the timer.
    let h = Harness::new(
        209,
        vec![
            // Turn 1: the model sets the timer.
            Step::Reply(
                ProviderResponse::ToolCalls(vec![tool_call(
                    "call_1",
                    "create_timer",
                    serde_json::json!({"name": "egg", "time": 0.02, "description": ""}),
                )]),
                None,
            ),
            Step::Reply(ProviderResponse::Final("Egg timer set.".into()), None),
            // Turn 2 (the fired event): the model announces it.
            Step::Reply(ProviderResponse::Final("Ding! Your egg timer is done.".into()), None),
        ],
        TrimPolicy::default(),
    )
    .await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let dispatcher_task = chime::engine::spawn_dispatcher(h.engine.clone(), cancel.clone());

    h.engine
        .send(h.chat_id, "set an egg timer for 1.2 seconds")
        .await
        .unwrap();

    // Wait for the fire → dispatcher → engine → connector round trip.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if h.texts().iter().any(|t| t.contains("egg timer is done")) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "fired notification never arrived; got {:?}",
            h.texts()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The synthetic instruction entered history as a user-role message.
    let history = h.persisted_history().await;
    assert!(history.iter().any(|m| matches!(
        m,
        Message::User(text) if text.contains("A timer named egg")
    )));

    cancel.cancel();
    let _ = dispatcher_task.await;
    h.runtime.shutdown().await;
}
