//! Calendar lookup capability — Google Calendar v3, read-only.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use serde_json::Value;

/// Read-only calendar collaborator, reachable only through the tool
/// dispatcher.
#[async_trait]
pub trait CalendarClient: Send + Sync {
    /// Human-readable summary of today's events.
    async fn events_today(&self) -> anyhow::Result<String>;
}

/// Google Calendar API client (API-key authenticated).
pub struct GoogleCalendar {
    client: Client,
    api_key: String,
    calendar_id: String,
    tz: Tz,
    base_url: String,
}

impl GoogleCalendar {
    pub fn new(api_key: String, calendar_id: String, tz: Tz) -> Self {
        Self::with_base_url(
            api_key,
            calendar_id,
            tz,
            "https://www.googleapis.com/calendar/v3".to_string(),
        )
    }

    /// Explicit base URL, useful for tests.
    pub fn with_base_url(api_key: String, calendar_id: String, tz: Tz, base_url: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            api_key,
            calendar_id,
            tz,
            base_url,
        }
    }

    /// Start and end of the current day in the configured timezone, as
    /// RFC3339 strings.
    fn today_bounds(&self) -> anyhow::Result<(String, String)> {
        let today = Utc::now().with_timezone(&self.tz).date_naive();
        let start = today
            .and_hms_opt(0, 0, 0)
            .and_then(|dt| self.tz.from_local_datetime(&dt).earliest())
            .ok_or_else(|| anyhow::anyhow!("cannot compute start of day"))?;
        let end = today
            .and_hms_opt(23, 59, 59)
            .and_then(|dt| self.tz.from_local_datetime(&dt).latest())
            .ok_or_else(|| anyhow::anyhow!("cannot compute end of day"))?;
        Ok((start.to_rfc3339(), end.to_rfc3339()))
    }
}

#[async_trait]
impl CalendarClient for GoogleCalendar {
    async fn events_today(&self) -> anyhow::Result<String> {
        let (time_min, time_max) = self.today_bounds()?;
        let url = format!("{}/calendars/{}/events", self.base_url, self.calendar_id);

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("timeMin", time_min.as_str()),
                ("timeMax", time_max.as_str()),
                ("singleEvents", "true"),
                ("orderBy", "startTime"),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Calendar API returned {status}: {text}");
        }

        let json: Value = resp.json().await?;
        let items = json["items"].as_array().cloned().unwrap_or_default();
        Ok(format_events(&items))
    }
}

/// Render a list of calendar event objects as the summary text handed to
/// the model.
pub fn format_events(items: &[Value]) -> String {
    if items.is_empty() {
        return "No Events for Today.".to_string();
    }

    let mut text = String::from("Events for Today:\n");
    for event in items {
        let summary = event["summary"].as_str().unwrap_or("(untitled)");
        let start = event_time(&event["start"]);
        let end = event_time(&event["end"]);
        let description = match event["description"].as_str() {
            Some(d) => format!(", Description: {d}"),
            None => String::new(),
        };
        text.push_str(&format!(
            "- Title: {summary}, Start: {start}, End: {end}{description}\n"
        ));
    }
    text
}

/// All-day events carry `date`, timed events carry `dateTime`.
fn event_time(field: &Value) -> String {
    field["dateTime"]
        .as_str()
        .or_else(|| field["date"].as_str())
        .unwrap_or("?")
        .to_string()
}

// ── Tests ────────────────────────────────────────────────────
