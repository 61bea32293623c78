//! Communication layer between transports, fired jobs, and the engine.
//!
//! [`IncomingMessage`] is the transport-agnostic envelope produced by the
//! chat connector and by fired jobs; a process-wide broadcast channel
//! carries it to the conversation engine.
//!
//! Outbound traffic flows the other way: [`Outbound`] payloads are handed
//! to whichever registered [`ChannelConnector`] claims the chat. Delivery
//! is best-effort; an unmatched chat is logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::sync::{broadcast, RwLock};

// ---------------------------------------------------------------------------
// IncomingMessage
// ---------------------------------------------------------------------------

/// A transport-agnostic inbound event: a user message, a transcribed voice
/// note, or the synthetic instruction synthesized by a fired job.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IncomingMessage {
    /// Conversation key and delivery target.
    pub chat_id: i64,
    /// Who produced the event (`"user"`, `"timer:tea"`, `"alarm:wake"`).
    pub author: String,
    /// Raw text fed into the conversation engine.
    pub content: String,
    /// Unix-epoch timestamp (seconds).
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

/// Payloads a connector can deliver to a chat.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Plain text message.
    Text(String),
    /// Text plus a cancel affordance keyed by the derived job name.
    TextWithCancel { text: String, job_name: String },
    /// Synthesized speech audio.
    Voice(Vec<u8>),
}

// ---------------------------------------------------------------------------
// Global broadcast channel
// ---------------------------------------------------------------------------

/// Capacity of the in-process event bus.
const BUS_CAPACITY: usize = 256;

/// Lazily-created global bus sender.
static SENDER: Lazy<broadcast::Sender<IncomingMessage>> = Lazy::new(|| {
    let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
    tx
});

/// Clone of the global bus sender. Producers (the chat transport, the
/// job runtime) call `sender().send(msg)` to push an event.
pub fn sender() -> broadcast::Sender<IncomingMessage> {
    SENDER.clone()
}

/// Independent receiver on the global bus; sees only events sent after
/// subscription.
pub fn subscribe() -> broadcast::Receiver<IncomingMessage> {
    SENDER.subscribe()
}

// ---------------------------------------------------------------------------
// ChannelConnector trait + global registry
// ---------------------------------------------------------------------------

/// A channel connector can deliver outbound payloads to a specific
/// platform.
///
/// Connectors are registered at startup; delivery looks up the first
/// connector whose [`matches`](ChannelConnector::matches) accepts the chat.
#[async_trait]
pub trait ChannelConnector: Send + Sync + 'static {
    /// A short identifier, unique within the registry.
    fn name(&self) -> &str;

    /// Return true if this connector should handle the given chat.
    fn matches(&self, chat_id: i64) -> bool;

    /// Deliver `payload` to the chat.
    async fn deliver(&self, chat_id: i64, payload: Outbound) -> anyhow::Result<()>;
}

/// Connector registry, keyed by connector name.
static CONNECTORS: Lazy<RwLock<HashMap<String, Arc<dyn ChannelConnector>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a connector, replacing any previous one with the same name.
pub async fn register_connector(connector: Arc<dyn ChannelConnector>) {
    let name = connector.name().to_string();
    CONNECTORS.write().await.insert(name, connector);
}

/// Deliver a payload through whichever connector matches `chat_id`.
///
/// Best-effort: a delivery failure or an unmatched chat is logged, never
/// propagated — outbound notifications must not abort the action that
/// produced them.
pub async fn deliver(chat_id: i64, payload: Outbound) {
    let connector = {
        let connectors = CONNECTORS.read().await;
        connectors.values().find(|c| c.matches(chat_id)).cloned()
    };
    match connector {
        Some(connector) => {
            if let Err(e) = connector.deliver(chat_id, payload).await {
                tracing::warn!(chat = chat_id, error = %e, "outbound delivery failed");
            }
        }
        None => {
            tracing::debug!(chat = chat_id, "no connector matched chat — payload dropped");
        }
    }
}

/// Deliver a plain text message.
pub async fn deliver_text(chat_id: i64, text: &str) {
    deliver(chat_id, Outbound::Text(text.to_string())).await;
}

/// Deliver synthesized speech audio.
pub async fn deliver_voice(chat_id: i64, audio: Vec<u8>) {
    deliver(chat_id, Outbound::Voice(audio)).await;
}
