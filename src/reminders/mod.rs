//! Reminder service: timer and alarm semantics on top of the job runtime.
//!
//! Timers are one-shot (`"timer:<name>"`, fire once after a delay);
//! alarms recur daily at a fixed local clock time (`"alarm:<name>"`).
//! Creating a job under an existing name cancels the prior one first.

use std::sync::Arc;

use chrono::NaiveTime;
use chrono::Utc;
use tracing::{info, warn};

use crate::comm::{self, Outbound};
use crate::error::ChimeError;
use crate::scheduler::store::{JobKind, JobRecord, JobStore, Trigger};
use crate::scheduler::JobRuntime;

/// Outcome of a create operation. The derived job name doubles as the
/// cancel affordance.
#[derive(Debug, Clone)]
pub struct Confirmation {
    /// Derived unique name (`"timer:tea"`), the key for `cancel`.
    pub job_name: String,
    /// A previous job with the same name was cancelled first.
    pub replaced: bool,
    /// The store write failed; the job lives only in memory and will not
    /// survive a restart.
    pub degraded: bool,
}

pub struct ReminderService {
    runtime: Arc<JobRuntime>,
    store: Arc<JobStore>,
}

impl ReminderService {
    pub fn new(runtime: Arc<JobRuntime>, store: Arc<JobStore>) -> Arc<Self> {
        Arc::new(Self { runtime, store })
    }

    /// Create a one-shot timer due `minutes` from now.
    ///
    /// Rejects non-positive durations before touching the store.
    pub async fn create_timer(
        &self,
        chat_id: i64,
        minutes: f64,
        name: &str,
        description: &str,
    ) -> Result<Confirmation, ChimeError> {
        if !minutes.is_finite() || minutes <= 0.0 {
            return Err(ChimeError::Validation(
                "minutes must be a positive number".to_string(),
            ));
        }
        if name.is_empty() {
            return Err(ChimeError::Validation(
                "the timer needs a name".to_string(),
            ));
        }

        let fire_at = Utc::now() + chrono::Duration::milliseconds((minutes * 60_000.0) as i64);
        let record = JobRecord {
            name: format!("timer:{name}"),
            kind: JobKind::Timer,
            trigger: Trigger::At(fire_at),
            chat_id,
            display_name: name.to_string(),
            description: description.to_string(),
            minutes: Some(minutes),
            silent: false,
        };
        self.install(record).await
    }

    /// Create a daily alarm at `time` (4-digit 24-hour clock, fixed
    /// timezone). Recurs until cancelled.
    pub async fn create_alarm(
        &self,
        chat_id: i64,
        time: &str,
        name: &str,
        description: &str,
        silent: bool,
    ) -> Result<Confirmation, ChimeError> {
        let time_of_day = parse_alarm_time(time)?;
        if name.is_empty() {
            return Err(ChimeError::Validation(
                "the alarm needs a name".to_string(),
            ));
        }

        let record = JobRecord {
            name: format!("alarm:{name}"),
            kind: JobKind::Alarm,
            trigger: Trigger::Daily(time_of_day),
            chat_id,
            display_name: name.to_string(),
            description: description.to_string(),
            minutes: None,
            silent,
        };
        self.install(record).await
    }

    /// Persist and schedule `record`, cancelling any job with the same
    /// name first.
    async fn install(&self, record: JobRecord) -> Result<Confirmation, ChimeError> {
        let job_name = record.name.clone();
        let replaced = self.runtime.cancel(&job_name).await;

        // A store write failure degrades to in-memory scheduling for this
        // job: the user-visible action still succeeds, with a warning.
        let degraded = match self.store.persist(&record) {
            Ok(()) => false,
            Err(e) => {
                warn!(job = %job_name, error = %e, "store write failed, scheduling in memory only");
                true
            }
        };

        self.runtime
            .schedule(record)
            .await
            .map_err(|e| ChimeError::Transient(format!("scheduling failed: {e}")))?;

        info!(job = %job_name, replaced, degraded, "reminder scheduled");
        Ok(Confirmation {
            job_name,
            replaced,
            degraded,
        })
    }

    /// Remove every job exactly matching `name`. Returns whether any were
    /// removed; no side effect when not found.
    pub async fn cancel(&self, name: &str) -> bool {
        self.runtime.cancel(name).await
    }

    /// Read-only snapshot of the active jobs.
    pub fn list(&self) -> Result<Vec<JobRecord>, ChimeError> {
        self.store
            .load_all()
            .map_err(|e| ChimeError::Persistence(e.to_string()))
    }
}

/// Parse a 4-digit 24-hour clock value ("0930", "09:30", "2345").
pub fn parse_alarm_time(input: &str) -> Result<NaiveTime, ChimeError> {
    let invalid = || {
        ChimeError::Validation(
            "time must be a 4-digit 24-hour value, for example 0300 or 2345".to_string(),
        )
    };

    let digits: String = input.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hour: u32 = digits[..2].parse().map_err(|_| invalid())?;
    let minute: u32 = digits[2..].parse().map_err(|_| invalid())?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}

/// Build the model-directed instruction for a fired job. The engine's
/// normal loop produces the user-facing notification from it.
pub fn fire_event_text(record: &JobRecord) -> String {
    let mut text = match record.kind {
        JobKind::Timer => format!(
            "A timer named {} for {} minutes is over, respond by informing the user of this fact without referencing this message.",
            record.display_name,
            format_minutes(record.minutes.unwrap_or(0.0)),
        ),
        JobKind::Alarm => {
            let when = match &record.trigger {
                Trigger::Daily(t) => t.format("%H:%M").to_string(),
                Trigger::At(_) => "now".to_string(),
            };
            format!(
                "An alarm named {} for today at {} is going off, respond by informing the user of this fact without referencing this message.",
                record.display_name, when,
            )
        }
    };

    if !record.description.is_empty() {
        text.push_str(&format!(
            "\nThe user wrote the following DESCRIPTION:\n{}",
            record.description
        ));
        text.push_str(
            "\nIf the user requested external information or actions in the DESCRIPTION, use function calling to do so.",
        );
    }
    text
}

/// Push the platform confirmation for a successful create: replacement
/// notice, degraded-durability warning, and the cancel affordance.
pub async fn announce_confirmation(chat_id: i64, kind: JobKind, confirmation: &Confirmation) {
    let label = match kind {
        JobKind::Timer => "timer",
        JobKind::Alarm => "alarm",
    };
    if confirmation.replaced {
        comm::deliver_text(
            chat_id,
            &format!("Cleared previous {label} with the same name."),
        )
        .await;
    }
    if confirmation.degraded {
        comm::deliver_text(
            chat_id,
            &format!("Warning: could not save the {label} to disk; it will not survive a restart."),
        )
        .await;
    }
    let capitalized = match kind {
        JobKind::Timer => "Timer",
        JobKind::Alarm => "Alarm",
    };
    comm::deliver(
        chat_id,
        Outbound::TextWithCancel {
            text: format!(
                "{capitalized} successfully set! To cancel the {label} use the following command:"
            ),
            job_name: confirmation.job_name.clone(),
        },
    )
    .await;
}

/// Render fractional minutes without a trailing ".0" for whole values.
fn format_minutes(minutes: f64) -> String {
    if minutes.fract() == 0.0 {
        format!("{}", minutes as i64)
    } else {
        format!("{minutes}")
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_times() {
        assert_eq!(
            parse_alarm_time("0930").unwrap(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap()
        );
        assert_eq!(
            parse_alarm_time("09:30").unwrap(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap()
        );
        assert_eq!(
            parse_alarm_time("2345").unwrap(),
            NaiveTime::from_hms_opt(23, 45, 0).unwrap()
        );
        assert_eq!(
            parse_alarm_time("0000").unwrap(),
            NaiveTime::from_hms_opt(0, 0, 0).unwrap()
        );
    }

    #[test]
    fn parse_rejects_malformed_times() {
        for bad in ["930", "24:00", "2460", "ab:cd", "", "12345", "7:30"] {
            assert!(
                matches!(parse_alarm_time(bad), Err(ChimeError::Validation(_))),
                "expected validation error for {bad:?}"
            );
        }
    }

    #[test]
    fn timer_fire_text_mentions_name_and_minutes() {
        let record = JobRecord {
            name: "timer:tea".into(),
            kind: JobKind::Timer,
            trigger: Trigger::At(Utc::now()),
            chat_id: 1,
            display_name: "tea".into(),
            description: String::new(),
            minutes: Some(5.0),
            silent: false,
        };
        let text = fire_event_text(&record);
        assert!(text.contains("A timer named tea for 5 minutes is over"));
        assert!(!text.contains("DESCRIPTION"));
    }

    #[test]
    fn fire_text_includes_description_block() {
        let record = JobRecord {
            name: "alarm:wake".into(),
            kind: JobKind::Alarm,
            trigger: Trigger::Daily(NaiveTime::from_hms_opt(7, 30, 0).unwrap()),
            chat_id: 1,
            display_name: "wake".into(),
            description: "check the calendar".into(),
            minutes: None,
            silent: false,
        };
        let text = fire_event_text(&record);
        assert!(text.contains("An alarm named wake for today at 07:30 is going off"));
        assert!(text.contains("DESCRIPTION"));
        assert!(text.contains("check the calendar"));
        assert!(text.contains("use function calling"));
    }

    #[test]
    fn fractional_minutes_render_without_padding() {
        assert_eq!(format_minutes(5.0), "5");
        assert_eq!(format_minutes(2.5), "2.5");
    }
}
