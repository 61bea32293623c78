//! Conversation engine: per-chat history, the model call loop, and tool
//! dispatch.
//!
//! Each chat id owns a [`ConversationContext`] (its history plus the
//! backing store) behind a mutex held for the duration of a turn — that
//! single lock is the serialization discipline for appends, persists, and
//! trimming. Fired jobs re-enter through the same bus dispatcher as user
//! messages, so they take the same lock before touching history.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::comm;
use crate::error::ChimeError;
use crate::history::{History, HistoryStore, Message, ToolCall};
use crate::models::{self, ChatMessage, ModelProvider, ProviderResponse, TokenUsage};
use crate::speech::SpeechSynthesizer;
use crate::tools::ToolDispatcher;

/// Generic text delivered when a model call fails; the detail stays in
/// the log.
const TRANSIENT_APOLOGY: &str =
    "Sorry, something went wrong while thinking about that. Please try again.";

/// Built-in system prompt used when none is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful personal assistant. You can set \
    timers and daily alarms, look up today's calendar, and generate images through the provided \
    functions. Keep replies short and conversational.";

/// Model round-trips attempted per call before giving up.
const MODEL_ATTEMPTS: usize = 2;

// ---------------------------------------------------------------------------
// Trimming policy
// ---------------------------------------------------------------------------

/// When the model reports more than `token_threshold` total tokens, drop
/// `trim_fraction` of the oldest history entries.
#[derive(Debug, Clone)]
pub struct TrimPolicy {
    pub token_threshold: u64,
    pub trim_fraction: f64,
}

impl Default for TrimPolicy {
    fn default() -> Self {
        Self {
            token_threshold: 8000,
            trim_fraction: 0.25,
        }
    }
}

// ---------------------------------------------------------------------------
// ConversationContext
// ---------------------------------------------------------------------------

/// One chat's history plus its backing store.
struct ConversationContext {
    history: History,
    store: HistoryStore,
}

impl ConversationContext {
    /// Load the persisted history for `chat_id`, degrading to an empty
    /// in-memory history when the file is unreadable.
    async fn open(dir: &std::path::Path, chat_id: i64) -> Self {
        let store = HistoryStore::new(dir, chat_id);
        let history = match store.load().await {
            Ok(messages) => History::from_messages(messages),
            Err(e) => {
                warn!(chat = chat_id, error = %e, "history unreadable, starting empty");
                History::new()
            }
        };
        Self { history, store }
    }

    /// Append one message and persist the full log.
    async fn append(&mut self, message: Message) {
        self.history.push(message);
        self.persist().await;
    }

    /// Persist the full log; a write failure degrades to in-memory only.
    async fn persist(&self) {
        if let Err(e) = self.store.save(self.history.messages()).await {
            warn!(path = %self.store.path().display(), error = %e,
                  "history write failed, continuing in memory");
        }
    }
}

// ---------------------------------------------------------------------------
// ConversationEngine
// ---------------------------------------------------------------------------

pub struct ConversationEngine {
    provider: Arc<dyn ModelProvider>,
    tools: ToolDispatcher,
    speech: Arc<dyn SpeechSynthesizer>,
    /// Immutable for the process lifetime, loaded once at startup.
    system_prompt: String,
    history_dir: PathBuf,
    trim: TrimPolicy,
    contexts: Mutex<HashMap<i64, Arc<Mutex<ConversationContext>>>>,
}

impl ConversationEngine {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: ToolDispatcher,
        speech: Arc<dyn SpeechSynthesizer>,
        system_prompt: String,
        history_dir: PathBuf,
        trim: TrimPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            tools,
            speech,
            system_prompt,
            history_dir,
            trim,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch or create the context for a chat.
    async fn context(&self, chat_id: i64) -> Arc<Mutex<ConversationContext>> {
        let mut map = self.contexts.lock().await;
        if let Some(ctx) = map.get(&chat_id) {
            return ctx.clone();
        }
        let ctx = Arc::new(Mutex::new(
            ConversationContext::open(&self.history_dir, chat_id).await,
        ));
        map.insert(chat_id, ctx.clone());
        ctx
    }

    /// Wipe the stored conversation for a chat.
    pub async fn reset(&self, chat_id: i64) -> anyhow::Result<()> {
        let ctx = self.context(chat_id).await;
        let mut ctx = ctx.lock().await;
        ctx.history.clear();
        ctx.store.save(&[]).await?;
        info!(chat = chat_id, "history reset");
        Ok(())
    }

    /// Run one conversation turn for `text` (a user message or a fired-job
    /// instruction).
    ///
    /// 1. Append `User(text)`, persist.
    /// 2. Call the model with the full history and the tool schema.
    /// 3. On tool calls: record them, dispatch each sequentially in the
    ///    order received (later calls may depend on earlier side effects),
    ///    persisting each result individually, then make a second model
    ///    call without the tool schema to force a plain-text answer.
    /// 4. Deliver the final text outward (text + synthesized speech).
    pub async fn send(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        let ctx = self.context(chat_id).await;
        let mut ctx = ctx.lock().await;

        ctx.append(Message::User(text.to_string())).await;

        let response = match self.model_call(&ctx, true).await {
            Ok(r) => r,
            Err(e) => {
                error!(chat = chat_id, error = %e, "model call failed");
                comm::deliver_text(chat_id, TRANSIENT_APOLOGY).await;
                return Err(e);
            }
        };
        self.apply_trim(&mut ctx, &response.1).await;

        match response.0 {
            ProviderResponse::ToolCalls(calls) => {
                let recorded: Vec<ToolCall> = calls
                    .iter()
                    .map(|c| ToolCall {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    })
                    .collect();
                ctx.append(Message::AssistantToolCalls(recorded)).await;

                for call in &calls {
                    let result = match self.tools.dispatch(chat_id, call).await {
                        Ok(text) => text,
                        Err(e @ ChimeError::Contract(_)) => {
                            // Registry and schema are validated at startup,
                            // so this is a programming error. Results
                            // recorded so far stay persisted.
                            error!(tool = %call.name, error = %e, "tool contract violation");
                            return Err(e.into());
                        }
                        Err(e) => {
                            warn!(tool = %call.name, error = %e, "tool call failed");
                            e.user_message()
                        }
                    };
                    // Persist after each individual result, so a mid-loop
                    // crash loses at most the next undispatched call.
                    ctx.append(Message::ToolResult {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        content: result,
                    })
                    .await;
                }

                // Second call without the tool schema: forces a plain-text
                // final answer over the updated history.
                let (final_response, usage) = match self.model_call(&ctx, false).await {
                    Ok(r) => r,
                    Err(e) => {
                        error!(chat = chat_id, error = %e, "model call failed (after tools)");
                        comm::deliver_text(chat_id, TRANSIENT_APOLOGY).await;
                        return Err(e);
                    }
                };
                self.apply_trim(&mut ctx, &usage).await;

                match final_response {
                    ProviderResponse::Final(content) if !content.is_empty() => {
                        ctx.append(Message::AssistantText(content.clone())).await;
                        self.deliver(chat_id, &content).await;
                    }
                    other => {
                        warn!(chat = chat_id, response = ?other,
                              "unhandled model response after tool loop, nothing delivered");
                    }
                }
            }
            ProviderResponse::Final(content) if !content.is_empty() => {
                ctx.append(Message::AssistantText(content.clone())).await;
                self.deliver(chat_id, &content).await;
            }
            ProviderResponse::Final(_) => {
                warn!(chat = chat_id, "model returned neither text nor tool calls");
            }
        }

        Ok(())
    }

    /// Call the model with the system prompt plus the full history.
    async fn model_call(
        &self,
        ctx: &ConversationContext,
        with_tools: bool,
    ) -> anyhow::Result<(ProviderResponse, Option<TokenUsage>)> {
        let mut messages = Vec::with_capacity(ctx.history.len() + 1);
        messages.push(ChatMessage::new("system", self.system_prompt.clone()));
        messages.extend(ctx.history.messages().iter().map(Message::to_chat));

        let defs = if with_tools {
            crate::tools::function_defs()
        } else {
            Vec::new()
        };

        models::send_with_retry(self.provider.as_ref(), &messages, &defs, MODEL_ATTEMPTS).await
    }

    /// Trim the oldest history entries when reported usage exceeds the
    /// threshold.
    async fn apply_trim(&self, ctx: &mut ConversationContext, usage: &Option<TokenUsage>) {
        let Some(usage) = usage else { return };
        debug!(tokens = usage.total_tokens, "model reported token usage");
        if usage.total_tokens > self.trim.token_threshold {
            let removed = ctx.history.trim_fraction(self.trim.trim_fraction);
            if removed > 0 {
                info!(
                    removed,
                    tokens = usage.total_tokens,
                    "trimmed oldest history entries"
                );
                ctx.persist().await;
            }
        }
    }

    /// Deliver a finalized assistant reply: text, then best-effort
    /// synthesized speech.
    async fn deliver(&self, chat_id: i64, text: &str) {
        comm::deliver_text(chat_id, text).await;
        match self.speech.synthesize(text).await {
            Ok(Some(audio)) => comm::deliver_voice(chat_id, audio).await,
            Ok(None) => {}
            Err(e) => warn!(chat = chat_id, error = %e, "speech synthesis failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Bus dispatcher
// ---------------------------------------------------------------------------

/// Subscribe to the comm bus and feed every inbound event through
/// [`ConversationEngine::send`].
///
/// Turns for the same chat serialize on the per-chat context mutex;
/// different chats run concurrently.
pub fn spawn_dispatcher(
    engine: Arc<ConversationEngine>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = comm::subscribe();
    tokio::spawn(async move {
        debug!("conversation dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("conversation dispatcher received shutdown signal");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(msg) => {
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            if let Err(e) = engine.send(msg.chat_id, &msg.content).await {
                                warn!(chat = msg.chat_id, author = %msg.author, error = %e,
                                      "conversation turn failed");
                            }
                        });
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "dispatcher lagged, dropped events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("message bus closed, dispatcher exiting");
                        break;
                    }
                }
            }
        }
    })
}
