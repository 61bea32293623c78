//! Conversation history: message model, the tool-call pairing invariant,
//! trimming, and the durable per-chat store.
//!
//! A [`Message`] serialises as the provider wire schema
//! (`{role, content?, tool_calls?, tool_call_id?, name?}`), so the
//! persisted file is exactly the payload the model sees. The whole log is
//! rewritten on every mutation — durability over raw throughput.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::ChatMessage;

// ── Message ──────────────────────────────────────────────────

/// A tool invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON-encoded argument object.
    pub arguments: String,
}

/// One entry in the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub enum Message {
    /// Text from the user, or a synthetic instruction from a fired job.
    User(String),
    /// A plain assistant reply.
    AssistantText(String),
    /// The assistant requested one or more tool invocations.
    AssistantToolCalls(Vec<ToolCall>),
    /// The host-side result of one tool invocation.
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

impl Message {
    /// Provider wire form of this entry.
    pub fn to_chat(&self) -> ChatMessage {
        match self {
            Message::User(text) => ChatMessage::new("user", text.clone()),
            Message::AssistantText(text) => ChatMessage::new("assistant", text.clone()),
            Message::AssistantToolCalls(calls) => ChatMessage {
                role: "assistant".into(),
                content: String::new(),
                tool_calls: Some(
                    calls
                        .iter()
                        .map(|c| {
                            serde_json::json!({
                                "id": c.id,
                                "type": "function",
                                "function": { "name": c.name, "arguments": c.arguments },
                            })
                        })
                        .collect(),
                ),
                tool_call_id: None,
                name: None,
            },
            Message::ToolResult {
                call_id,
                name,
                content,
            } => ChatMessage {
                role: "tool".into(),
                content: content.clone(),
                tool_calls: None,
                tool_call_id: Some(call_id.clone()),
                name: Some(name.clone()),
            },
        }
    }
}

// ── Wire schema ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunction,
}

/// The persisted / on-the-wire shape of a [`Message`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl From<Message> for WireMessage {
    fn from(m: Message) -> Self {
        match m {
            Message::User(content) => WireMessage {
                role: "user".into(),
                content: Some(content),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
            Message::AssistantText(content) => WireMessage {
                role: "assistant".into(),
                content: Some(content),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
            Message::AssistantToolCalls(calls) => WireMessage {
                role: "assistant".into(),
                content: None,
                tool_calls: Some(
                    calls
                        .into_iter()
                        .map(|c| WireToolCall {
                            id: c.id,
                            kind: "function".into(),
                            function: WireFunction {
                                name: c.name,
                                arguments: c.arguments,
                            },
                        })
                        .collect(),
                ),
                tool_call_id: None,
                name: None,
            },
            Message::ToolResult {
                call_id,
                name,
                content,
            } => WireMessage {
                role: "tool".into(),
                content: Some(content),
                tool_calls: None,
                tool_call_id: Some(call_id),
                name: Some(name),
            },
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = String;

    fn try_from(w: WireMessage) -> Result<Self, Self::Error> {
        match w.role.as_str() {
            "user" => Ok(Message::User(w.content.unwrap_or_default())),
            "assistant" => match w.tool_calls {
                Some(calls) => Ok(Message::AssistantToolCalls(
                    calls
                        .into_iter()
                        .map(|c| ToolCall {
                            id: c.id,
                            name: c.function.name,
                            arguments: c.function.arguments,
                        })
                        .collect(),
                )),
                None => Ok(Message::AssistantText(w.content.unwrap_or_default())),
            },
            "tool" => Ok(Message::ToolResult {
                call_id: w
                    .tool_call_id
                    .ok_or_else(|| "tool message without tool_call_id".to_string())?,
                name: w.name.unwrap_or_default(),
                content: w.content.unwrap_or_default(),
            }),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

// ── History ──────────────────────────────────────────────────

/// Ordered, insertion-order-significant conversation log. Append-only
/// during a turn; only the trim operation mutates it wholesale.
#[derive(Debug, Default, Clone)]
pub struct History {
    messages: Vec<Message>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Verify the pairing invariant: every `ToolResult` must match a
    /// `call_id` in the nearest preceding `AssistantToolCalls`, with no
    /// other message kind in between.
    pub fn check_pairing(&self) -> Result<(), String> {
        let mut open: Vec<&str> = Vec::new();
        for (idx, message) in self.messages.iter().enumerate() {
            match message {
                Message::AssistantToolCalls(calls) => {
                    open = calls.iter().map(|c| c.id.as_str()).collect();
                }
                Message::ToolResult { call_id, .. } => {
                    if !open.contains(&call_id.as_str()) {
                        return Err(format!(
                            "tool result at index {idx} has no matching preceding call_id {call_id}"
                        ));
                    }
                }
                _ => open.clear(),
            }
        }
        Ok(())
    }

    /// Remove `floor(len * fraction)` oldest entries as a contiguous
    /// prefix.
    ///
    /// The cut point is extended forward past any `ToolResult`, so a trim
    /// can never orphan a result whose paired `AssistantToolCalls` fell
    /// inside the removed prefix. Returns the number of entries removed.
    pub fn trim_fraction(&mut self, fraction: f64) -> usize {
        let mut cut = (self.messages.len() as f64 * fraction).floor() as usize;
        if cut == 0 {
            return 0;
        }
        while cut < self.messages.len()
            && matches!(self.messages[cut], Message::ToolResult { .. })
        {
            cut += 1;
        }
        self.messages.drain(..cut);
        cut
    }
}

// ── HistoryStore ─────────────────────────────────────────────

/// Durable storage for one chat's history: a single JSON file holding the
/// ordered message list, rewritten in full on every mutation.
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    /// Store handle for `dir/<chat_id>.json` (does NOT touch the
    /// filesystem).
    pub fn new(dir: &Path, chat_id: i64) -> Self {
        Self {
            path: dir.join(format!("{chat_id}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted history. A missing file is an empty history.
    pub async fn load(&self) -> anyhow::Result<Vec<Message>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.path.display()));
            }
        };
        serde_json::from_str(&content)
            .with_context(|| format!("parse history file {}", self.path.display()))
    }

    /// Write the full message list, creating the parent directory if
    /// necessary.
    pub async fn save(&self, messages: &[Message]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create history dir")?;
        }
        let json = serde_json::to_string_pretty(messages).context("serialize history")?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("write {}", self.path.display()))?;
        debug!(path = %self.path.display(), entries = messages.len(), "history persisted");
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────
