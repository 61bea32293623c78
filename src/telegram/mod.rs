//! Telegram transport: thin Bot API client, outbound connector, and the
//! long-poll loop that feeds user input into the conversation engine.
//!
//! Commands are parsed here at the boundary; everything stateful lives in
//! the reminder service and the engine. The only state this module keeps
//! is the update offset of the poll loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::comm::{self, ChannelConnector, Outbound};
use crate::engine::ConversationEngine;
use crate::error::ChimeError;
use crate::gcal::CalendarClient;
use crate::reminders::{self, ReminderService};
use crate::scheduler::store::{JobKind, JobRecord, Trigger};
use crate::speech::Transcriber;

const HELP_TEXT: &str = "Hi! The following commands are available:

Use /start or /help to see this message
Use /timer <minutes> <name> [...description] to set a timer
Use /alarm [--silent] <name> <24h-time> [...description] to set an alarm
Use /cancel <name> to stop and remove an alarm or timer
Use /jobs to view all alarms and timers
Use /calendar to view your calendar events for today
Use /forget to reset the conversation history";

// ---------------------------------------------------------------------------
// Bot API types
// ---------------------------------------------------------------------------

/// Envelope every Bot API response uses.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(default = "Option::default")]
    pub result: Option<T>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TgMessage>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TgMessage {
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<TgUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub voice: Option<Voice>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TgUser {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct Voice {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: TgUser,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TgFile {
    #[serde(default)]
    pub file_path: Option<String>,
}

// ---------------------------------------------------------------------------
// API client
// ---------------------------------------------------------------------------

/// HTTP client for the Telegram Bot API.
pub struct TelegramApi {
    client: Client,
    base_url: String,
    file_base_url: String,
}

impl TelegramApi {
    pub fn new(bot_token: &str) -> Self {
        let client = Client::builder()
            // Longer than the long-poll window so getUpdates never times
            // out client-side first.
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
            file_base_url: format!("https://api.telegram.org/file/bot{bot_token}"),
        }
    }

    fn unwrap_response<T>(resp: ApiResponse<T>, what: &str) -> anyhow::Result<T> {
        if !resp.ok {
            bail!(
                "{what} failed: {}",
                resp.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        resp.result.with_context(|| format!("{what} returned no result"))
    }

    /// Verify the bot token by calling `getMe`.
    pub async fn get_me(&self) -> anyhow::Result<serde_json::Value> {
        let resp: ApiResponse<serde_json::Value> = self
            .client
            .get(format!("{}/getMe", self.base_url))
            .send()
            .await
            .context("getMe request failed")?
            .json()
            .await
            .context("getMe response parse failed")?;
        Self::unwrap_response(resp, "getMe")
    }

    /// Long-poll for updates newer than `offset`.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> anyhow::Result<Vec<Update>> {
        let resp: ApiResponse<Vec<Update>> = self
            .client
            .post(format!("{}/getUpdates", self.base_url))
            .json(&json!({ "offset": offset, "timeout": timeout_secs }))
            .send()
            .await
            .context("getUpdates request failed")?
            .json()
            .await
            .context("getUpdates response parse failed")?;
        Self::unwrap_response(resp, "getUpdates")
    }

    /// Send a Markdown text message.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        self.send_message_body(json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        }))
        .await
    }

    /// Send a text message with an inline cancel button for `job_name`.
    pub async fn send_message_with_cancel(
        &self,
        chat_id: i64,
        text: &str,
        job_name: &str,
    ) -> anyhow::Result<()> {
        let callback = json!({ "cmd": "cancel", "job_name": job_name }).to_string();
        self.send_message_body(json!({
            "chat_id": chat_id,
            "text": text,
            "reply_markup": {
                "inline_keyboard": [[{
                    "text": format!("cancel {job_name}"),
                    "callback_data": callback,
                }]],
            },
        }))
        .await
    }

    async fn send_message_body(&self, body: serde_json::Value) -> anyhow::Result<()> {
        let resp: ApiResponse<serde_json::Value> = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&body)
            .send()
            .await
            .context("sendMessage request failed")?
            .json()
            .await
            .context("sendMessage response parse failed")?;
        Self::unwrap_response(resp, "sendMessage").map(|_| ())
    }

    /// Upload synthesized speech as a voice message.
    pub async fn send_voice(&self, chat_id: i64, audio: Vec<u8>) -> anyhow::Result<()> {
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("voice", Part::bytes(audio).file_name("voice.mp3"));

        let resp: ApiResponse<serde_json::Value> = self
            .client
            .post(format!("{}/sendVoice", self.base_url))
            .multipart(form)
            .send()
            .await
            .context("sendVoice request failed")?
            .json()
            .await
            .context("sendVoice response parse failed")?;
        Self::unwrap_response(resp, "sendVoice").map(|_| ())
    }

    /// Acknowledge a callback query so the client stops its spinner.
    pub async fn answer_callback_query(&self, callback_id: &str) -> anyhow::Result<()> {
        let resp: ApiResponse<serde_json::Value> = self
            .client
            .post(format!("{}/answerCallbackQuery", self.base_url))
            .json(&json!({ "callback_query_id": callback_id }))
            .send()
            .await
            .context("answerCallbackQuery request failed")?
            .json()
            .await
            .context("answerCallbackQuery response parse failed")?;
        Self::unwrap_response(resp, "answerCallbackQuery").map(|_| ())
    }

    /// Download a file (voice note) by its file id.
    pub async fn download_file(&self, file_id: &str) -> anyhow::Result<Vec<u8>> {
        let resp: ApiResponse<TgFile> = self
            .client
            .post(format!("{}/getFile", self.base_url))
            .json(&json!({ "file_id": file_id }))
            .send()
            .await
            .context("getFile request failed")?
            .json()
            .await
            .context("getFile response parse failed")?;
        let file = Self::unwrap_response(resp, "getFile")?;
        let path = file.file_path.context("getFile returned no file_path")?;

        let bytes = self
            .client
            .get(format!("{}/{}", self.file_base_url, path))
            .send()
            .await
            .context("file download failed")?
            .bytes()
            .await
            .context("file download read failed")?;
        Ok(bytes.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Outbound connector
// ---------------------------------------------------------------------------

/// Delivers engine output and reminder confirmations through the Bot API.
pub struct TelegramConnector {
    api: Arc<TelegramApi>,
}

#[async_trait]
impl ChannelConnector for TelegramConnector {
    fn name(&self) -> &str {
        "telegram"
    }

    fn matches(&self, _chat_id: i64) -> bool {
        true
    }

    async fn deliver(&self, chat_id: i64, payload: Outbound) -> anyhow::Result<()> {
        match payload {
            Outbound::Text(text) => self.api.send_message(chat_id, &text).await,
            Outbound::TextWithCancel { text, job_name } => {
                self.api
                    .send_message_with_cancel(chat_id, &text, &job_name)
                    .await
            }
            Outbound::Voice(audio) => self.api.send_voice(chat_id, audio).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Bot: polling loop + command handling
// ---------------------------------------------------------------------------

pub struct TelegramBot {
    api: Arc<TelegramApi>,
    engine: Arc<ConversationEngine>,
    reminders: Arc<ReminderService>,
    calendar: Option<Arc<dyn CalendarClient>>,
    transcriber: Option<Arc<dyn Transcriber>>,
    allowed_users: Vec<i64>,
}

impl TelegramBot {
    pub fn new(
        api: TelegramApi,
        engine: Arc<ConversationEngine>,
        reminders: Arc<ReminderService>,
        calendar: Option<Arc<dyn CalendarClient>>,
        transcriber: Option<Arc<dyn Transcriber>>,
        allowed_users: Vec<i64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            api: Arc::new(api),
            engine,
            reminders,
            calendar,
            transcriber,
            allowed_users,
        })
    }

    /// Register the outbound connector and start the long-poll loop.
    pub async fn spawn(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let me = self.api.get_me().await.context("telegram token rejected")?;
        info!(bot = %me["username"].as_str().unwrap_or("?"), "telegram bot authenticated");

        comm::register_connector(Arc::new(TelegramConnector {
            api: self.api.clone(),
        }))
        .await;

        Ok(tokio::spawn(async move { self.poll_loop(cancel).await }))
    }

    async fn poll_loop(&self, cancel: CancellationToken) {
        let mut offset = 0i64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("telegram poll loop shutting down");
                    break;
                }
                result = self.api.get_updates(offset, 30) => match result {
                    Ok(updates) => {
                        for update in updates {
                            offset = offset.max(update.update_id + 1);
                            self.handle_update(update).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "getUpdates failed, backing off");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }

    fn authorized(&self, user_id: Option<i64>) -> bool {
        self.allowed_users.is_empty() || user_id.is_some_and(|u| self.allowed_users.contains(&u))
    }

    async fn handle_update(&self, update: Update) {
        if let Some(cb) = update.callback_query {
            self.handle_callback(cb).await;
            return;
        }
        let Some(msg) = update.message else { return };
        let chat_id = msg.chat.id;

        if !self.authorized(msg.from.as_ref().map(|u| u.id)) {
            self.reply(chat_id, "You are not authorized to talk to this bot!")
                .await;
            return;
        }

        if let Some(voice) = msg.voice {
            self.handle_voice(chat_id, &voice).await;
            return;
        }

        let Some(text) = msg.text else { return };
        if let Some(command) = text.strip_prefix('/') {
            self.handle_command(chat_id, command).await;
        } else {
            publish(chat_id, "user", &text);
        }
    }

    async fn handle_command(&self, chat_id: i64, command: &str) {
        let mut parts = command.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        match name {
            "start" | "help" => self.reply(chat_id, HELP_TEXT).await,
            "timer" => match parse_timer_args(&args) {
                Ok((minutes, timer_name, description)) => {
                    match self
                        .reminders
                        .create_timer(chat_id, minutes, timer_name, &description)
                        .await
                    {
                        Ok(confirmation) => {
                            reminders::announce_confirmation(chat_id, JobKind::Timer, &confirmation)
                                .await;
                        }
                        Err(e) => self.reply(chat_id, &e.user_message()).await,
                    }
                }
                Err(_) => {
                    self.reply(chat_id, "Usage: /timer <minutes> <name> <description>")
                        .await
                }
            },
            "alarm" => match parse_alarm_args(&args) {
                Ok((silent, alarm_name, time, description)) => {
                    match self
                        .reminders
                        .create_alarm(chat_id, time, alarm_name, &description, silent)
                        .await
                    {
                        Ok(confirmation) => {
                            reminders::announce_confirmation(chat_id, JobKind::Alarm, &confirmation)
                                .await;
                        }
                        Err(e) => self.reply(chat_id, &e.user_message()).await,
                    }
                }
                Err(_) => {
                    self.reply(chat_id, "Usage: /alarm [--silent] <name> <24h-time> <description>")
                        .await
                }
            },
            "cancel" => match args.first() {
                Some(job_name) => {
                    let found = self.reminders.cancel(job_name).await;
                    let text = if found {
                        "Job successfully cancelled!"
                    } else {
                        "Failed to find a job with that name."
                    };
                    self.reply(chat_id, text).await;
                }
                None => self.reply(chat_id, "Please specify a job name!").await,
            },
            "jobs" => match self.reminders.list() {
                Ok(records) => self.reply(chat_id, &format_jobs(&records)).await,
                Err(e) => {
                    warn!(error = %e, "job listing failed");
                    self.reply(chat_id, &e.user_message()).await;
                }
            },
            "calendar" => match &self.calendar {
                Some(calendar) => match calendar.events_today().await {
                    Ok(text) => self.reply(chat_id, &text).await,
                    Err(e) => {
                        warn!(error = %e, "calendar lookup failed");
                        self.reply(chat_id, "The calendar could not be reached right now.")
                            .await;
                    }
                },
                None => self.reply(chat_id, "Calendar lookup is not configured.").await,
            },
            "forget" => match self.engine.reset(chat_id).await {
                Ok(()) => self.reply(chat_id, "Hard Reset Successful!").await,
                Err(e) => {
                    warn!(error = %e, "history reset failed");
                    self.reply(chat_id, "Could not reset the history.").await;
                }
            },
            _ => {
                self.reply(chat_id, "Sorry, I didn't understand that command.")
                    .await
            }
        }
    }

    async fn handle_voice(&self, chat_id: i64, voice: &Voice) {
        let Some(transcriber) = &self.transcriber else {
            self.reply(chat_id, "Voice input is not configured.").await;
            return;
        };

        let audio = match self.api.download_file(&voice.file_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "voice download failed");
                self.reply(chat_id, "I couldn't fetch that voice message.")
                    .await;
                return;
            }
        };

        match transcriber.transcribe(audio, "voice.oga").await {
            Ok(transcription) => {
                self.reply(chat_id, &format!("I heard: {transcription}")).await;
                publish(chat_id, "user", &transcription);
            }
            Err(e) => {
                warn!(error = %e, "transcription failed");
                self.reply(chat_id, "I couldn't understand that voice message.")
                    .await;
            }
        }
    }

    async fn handle_callback(&self, cb: CallbackQuery) {
        // Callback queries must always be answered.
        if let Err(e) = self.api.answer_callback_query(&cb.id).await {
            warn!(error = %e, "answerCallbackQuery failed");
        }

        if !self.authorized(Some(cb.from.id)) {
            return;
        }
        let Some(chat_id) = cb.message.map(|m| m.chat.id) else {
            return;
        };

        match cb.data.as_deref().map(parse_callback_data) {
            Some(Ok(job_name)) => {
                let found = self.reminders.cancel(&job_name).await;
                let text = if found {
                    "Job successfully cancelled!"
                } else {
                    "Failed to find a job with that name."
                };
                self.reply(chat_id, text).await;
            }
            other => debug!(data = ?other, "unhandled callback query"),
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.api.send_message(chat_id, text).await {
            warn!(chat = chat_id, error = %e, "reply failed");
        }
    }
}

/// Push an inbound event onto the comm bus for the engine dispatcher.
fn publish(chat_id: i64, author: &str, content: &str) {
    let msg = comm::IncomingMessage {
        chat_id,
        author: author.to_string(),
        content: content.to_string(),
        timestamp: chrono::Utc::now().timestamp(),
    };
    if let Err(e) = comm::sender().send(msg) {
        warn!(chat = chat_id, error = %e, "no receivers for inbound message");
    }
}

// ---------------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------------

fn parse_timer_args<'a>(args: &[&'a str]) -> Result<(f64, &'a str, String), ChimeError> {
    let usage = || ChimeError::Validation("Usage: /timer <minutes> <name> <description>".into());
    let minutes: f64 = args.first().ok_or_else(usage)?.parse().map_err(|_| usage())?;
    let name = args.get(1).copied().ok_or_else(usage)?;
    Ok((minutes, name, args[2..].join(" ")))
}

fn parse_alarm_args<'a>(args: &[&'a str]) -> Result<(bool, &'a str, &'a str, String), ChimeError> {
    let usage =
        || ChimeError::Validation("Usage: /alarm [--silent] <name> <24h-time> <description>".into());
    let (silent, rest) = match args.first() {
        Some(&"--silent") => (true, &args[1..]),
        _ => (false, args),
    };
    let name = rest.first().copied().ok_or_else(usage)?;
    let time = rest.get(1).copied().ok_or_else(usage)?;
    Ok((silent, name, time, rest[2..].join(" ")))
}

fn parse_callback_data(data: &str) -> Result<String, ChimeError> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| ChimeError::Validation(format!("malformed callback data: {e}")))?;
    if value["cmd"] != "cancel" {
        return Err(ChimeError::Validation("unknown callback command".into()));
    }
    value["job_name"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ChimeError::Validation("callback data without job_name".into()))
}

/// Render the active-job snapshot for `/jobs`.
fn format_jobs(records: &[JobRecord]) -> String {
    if records.is_empty() {
        return "No active jobs.".to_string();
    }
    let mut text = String::from("Active jobs:\n");
    for record in records {
        let when = match &record.trigger {
            Trigger::At(t) => format!("fires at {}", t.to_rfc3339()),
            Trigger::Daily(t) => format!("daily at {}", t.format("%H:%M")),
        };
        text.push_str(&format!("- {} ({when})\n", record.name));
    }
    text
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn timer_args_parse() {
        let (minutes, name, description) =
            parse_timer_args(&["5", "tea", "green", "tea"]).unwrap();
        assert_eq!(minutes, 5.0);
        assert_eq!(name, "tea");
        assert_eq!(description, "green tea");

        assert!(parse_timer_args(&["five", "tea"]).is_err());
        assert!(parse_timer_args(&["5"]).is_err());
        assert!(parse_timer_args(&[]).is_err());
    }

    #[test]
    fn alarm_args_parse_with_silent_flag() {
        let (silent, name, time, description) =
            parse_alarm_args(&["--silent", "wake", "0700", "rise", "and", "shine"]).unwrap();
        assert!(silent);
        assert_eq!(name, "wake");
        assert_eq!(time, "0700");
        assert_eq!(description, "rise and shine");

        let (silent, name, time, description) = parse_alarm_args(&["wake", "0700"]).unwrap();
        assert!(!silent);
        assert_eq!(name, "wake");
        assert_eq!(time, "0700");
        assert_eq!(description, "");

        assert!(parse_alarm_args(&["--silent", "wake"]).is_err());
        assert!(parse_alarm_args(&[]).is_err());
    }

    #[test]
    fn callback_data_round_trip() {
        let data = json!({ "cmd": "cancel", "job_name": "timer:tea" }).to_string();
        assert_eq!(parse_callback_data(&data).unwrap(), "timer:tea");

        assert!(parse_callback_data("not json").is_err());
        assert!(parse_callback_data(r#"{"cmd":"other"}"#).is_err());
    }

    #[test]
    fn jobs_snapshot_formatting() {
        assert_eq!(format_jobs(&[]), "No active jobs.");

        let records = vec![JobRecord {
            name: "alarm:wake".into(),
            kind: JobKind::Alarm,
            trigger: Trigger::Daily(NaiveTime::from_hms_opt(7, 0, 0).unwrap()),
            chat_id: 1,
            display_name: "wake".into(),
            description: String::new(),
            minutes: None,
            silent: false,
        }];
        let text = format_jobs(&records);
        assert!(text.contains("alarm:wake"));
        assert!(text.contains("daily at 07:00"));
    }
}
