//! Tool dispatcher: the static registry of capabilities the model can
//! invoke mid-conversation.
//!
//! The registry is a closed enum rather than a name → handler map, and
//! [`validate_registry`] checks it against the advertised schema at
//! startup, so an undispatchable function name can never reach the model.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::ChimeError;
use crate::gcal::CalendarClient;
use crate::models::{ImageGenerator, ToolCallItem};
use crate::reminders::ReminderService;
use crate::scheduler::store::JobKind;

// ── Registry ─────────────────────────────────────────────────

/// Every capability the model can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    CreateTimer,
    CreateAlarm,
    CalendarToday,
    GenerateImage,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::CreateTimer,
        ToolKind::CreateAlarm,
        ToolKind::CalendarToday,
        ToolKind::GenerateImage,
    ];

    /// The function name advertised to the model.
    pub fn name(self) -> &'static str {
        match self {
            ToolKind::CreateTimer => "create_timer",
            ToolKind::CreateAlarm => "create_alarm",
            ToolKind::CalendarToday => "get_calendar_events_today",
            ToolKind::GenerateImage => "generate_image",
        }
    }

    /// Resolve an advertised name back to its kind.
    pub fn from_name(name: &str) -> Option<ToolKind> {
        ToolKind::ALL.into_iter().find(|k| k.name() == name)
    }
}

/// The advertised function schema, in the provider `tools` array format.
pub fn function_defs() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": ToolKind::CreateTimer.name(),
                "description": "Sets a timer that is triggered only once in the specified number of minutes.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "The name of the timer, if not given by the user come up with one based on the description",
                        },
                        "time": {
                            "type": "number",
                            "description": "number of minutes in which to trigger the timer, cannot be negative",
                        },
                        "description": {
                            "type": "string",
                            "description": "The user specified description or text for the timer",
                        },
                    },
                    "required": ["name", "time", "description"],
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": ToolKind::CreateAlarm.name(),
                "description": "Sets an alarm that is triggered daily at a certain time.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "The name of the alarm, if not given by the user come up with one based on the description",
                        },
                        "time": {
                            "type": "string",
                            "description": "24 hour time, for example 0300 or 2345",
                        },
                        "description": {
                            "type": "string",
                            "description": "The user specified description or text for the alarm",
                        },
                        "silent": {
                            "type": "boolean",
                            "description": "If the notification should be silent or quiet so as to not disturb the user",
                        },
                    },
                    "required": ["name", "time", "description"],
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": ToolKind::CalendarToday.name(),
                "description": "Gets the calendar events for today",
                "parameters": { "type": "object", "properties": {} }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": ToolKind::GenerateImage.name(),
                "description": "Generates an image with the given prompt, returns the url to the image.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "prompt": {
                            "type": "string",
                            "description": "The prompt describing the image",
                        },
                    },
                    "required": ["prompt"],
                }
            }
        }),
    ]
}

/// Verify that the advertised schema and the dispatchable set agree.
///
/// Run once at startup: when this passes, an unknown tool name coming back
/// from the model is a programming error, not a runtime condition.
pub fn validate_registry() -> anyhow::Result<()> {
    let advertised: Vec<String> = function_defs()
        .iter()
        .filter_map(|d| d["function"]["name"].as_str().map(String::from))
        .collect();

    for name in &advertised {
        if ToolKind::from_name(name).is_none() {
            anyhow::bail!("tool schema advertises undispatchable function '{name}'");
        }
    }
    for kind in ToolKind::ALL {
        if !advertised.iter().any(|n| n == kind.name()) {
            anyhow::bail!("tool '{}' is dispatchable but not advertised", kind.name());
        }
    }
    Ok(())
}

// ── Argument shapes ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TimerArgs {
    name: String,
    time: f64,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct AlarmArgs {
    name: String,
    time: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    silent: bool,
}

#[derive(Debug, Deserialize)]
struct ImageArgs {
    prompt: String,
}

fn parse_args<T: DeserializeOwned>(value: Value, tool: &str) -> Result<T, ChimeError> {
    serde_json::from_value(value).map_err(|e| {
        ChimeError::Contract(format!("arguments for {tool} do not match the schema: {e}"))
    })
}

// ── Dispatcher ───────────────────────────────────────────────

/// Routes a model-requested function call to its concrete capability.
pub struct ToolDispatcher {
    reminders: Arc<ReminderService>,
    calendar: Option<Arc<dyn CalendarClient>>,
    images: Arc<dyn ImageGenerator>,
}

impl ToolDispatcher {
    pub fn new(
        reminders: Arc<ReminderService>,
        calendar: Option<Arc<dyn CalendarClient>>,
        images: Arc<dyn ImageGenerator>,
    ) -> Self {
        Self {
            reminders,
            calendar,
            images,
        }
    }

    /// Execute one requested call and return the short text result the
    /// model paraphrases — never echoed to the user verbatim.
    ///
    /// Unknown names and non-schema arguments are contract violations and
    /// abort the turn. Capability-level failures (bad duration, service
    /// down) come back as result text so the model can tell the user.
    pub async fn dispatch(&self, chat_id: i64, call: &ToolCallItem) -> Result<String, ChimeError> {
        let kind = ToolKind::from_name(&call.name)
            .ok_or_else(|| ChimeError::Contract(format!("unknown tool: {}", call.name)))?;
        let args: Value = serde_json::from_str(&call.arguments).map_err(|e| {
            ChimeError::Contract(format!(
                "arguments for {} are not valid JSON: {e}",
                call.name
            ))
        })?;

        info!(tool = %call.name, call_id = %call.id, "dispatching tool call");

        match kind {
            ToolKind::CreateTimer => {
                let args: TimerArgs = parse_args(args, "create_timer")?;
                match self
                    .reminders
                    .create_timer(chat_id, args.time, &args.name, &args.description)
                    .await
                {
                    Ok(confirmation) => {
                        crate::reminders::announce_confirmation(
                            chat_id,
                            JobKind::Timer,
                            &confirmation,
                        )
                        .await;
                        Ok("Timer set successfully! Do not execute the timer, just inform the user of this fact.".to_string())
                    }
                    Err(e) => {
                        warn!(error = %e, "create_timer rejected");
                        Ok(e.user_message())
                    }
                }
            }
            ToolKind::CreateAlarm => {
                let args: AlarmArgs = parse_args(args, "create_alarm")?;
                match self
                    .reminders
                    .create_alarm(chat_id, &args.time, &args.name, &args.description, args.silent)
                    .await
                {
                    Ok(confirmation) => {
                        crate::reminders::announce_confirmation(
                            chat_id,
                            JobKind::Alarm,
                            &confirmation,
                        )
                        .await;
                        Ok("Alarm set successfully! Do not execute the alarm, just inform the user of this fact.".to_string())
                    }
                    Err(e) => {
                        warn!(error = %e, "create_alarm rejected");
                        Ok(e.user_message())
                    }
                }
            }
            ToolKind::CalendarToday => match &self.calendar {
                Some(calendar) => match calendar.events_today().await {
                    Ok(text) => Ok(text),
                    Err(e) => {
                        warn!(error = %e, "calendar lookup failed");
                        Ok("The calendar could not be reached right now.".to_string())
                    }
                },
                None => Ok("Calendar lookup is not configured.".to_string()),
            },
            ToolKind::GenerateImage => {
                let args: ImageArgs = parse_args(args, "generate_image")?;
                match self.images.generate_image(&args.prompt).await {
                    Ok(url) => Ok(url),
                    Err(e) => {
                        warn!(error = %e, "image generation failed");
                        Ok("Image generation failed, please try again.".to_string())
                    }
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_consistent() {
        validate_registry().unwrap();
    }

    #[test]
    fn names_round_trip() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ToolKind::from_name("exec_shell"), None);
    }

    #[test]
    fn schema_advertises_every_kind_once() {
        let defs = function_defs();
        assert_eq!(defs.len(), ToolKind::ALL.len());
        for def in &defs {
            assert_eq!(def["type"], "function");
            assert!(def["function"]["name"].is_string());
            assert!(def["function"]["parameters"].is_object());
        }
    }

    #[test]
    fn timer_args_require_time_number() {
        let ok: Result<TimerArgs, _> = parse_args(
            json!({"name": "tea", "time": 5, "description": ""}),
            "create_timer",
        );
        assert!(ok.is_ok());

        let bad: Result<TimerArgs, _> = parse_args(
            json!({"name": "tea", "time": "five", "description": ""}),
            "create_timer",
        );
        assert!(matches!(bad, Err(ChimeError::Contract(_))));
    }

    #[test]
    fn alarm_args_default_silent_false() {
        let args: AlarmArgs = parse_args(
            json!({"name": "wake", "time": "0700", "description": "rise"}),
            "create_alarm",
        )
        .unwrap();
        assert!(!args.silent);
    }
}
