//! Job runtime: in-memory scheduling and firing of persisted jobs.
//!
//! Wraps `tokio_cron_scheduler` and keeps a name → job-uuid map so
//! replace-by-name and cancel can remove live jobs. A fired job
//! synthesizes a model-directed instruction and publishes it on the
//! [`crate::comm`] bus; the conversation engine's normal loop turns it
//! into the user-facing notification.

pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::comm;
use store::{JobKind, JobRecord, JobStore, Trigger};

/// Live scheduler bound to the durable [`JobStore`].
///
/// Every schedule/replace/cancel mutation holds the name-map lock for its
/// full duration, so concurrent duplicate creations serialize and exactly
/// one job per name survives.
pub struct JobRuntime {
    sched: JobScheduler,
    store: Arc<JobStore>,
    tz: chrono_tz::Tz,
    job_uuids: Arc<Mutex<HashMap<String, uuid::Uuid>>>,
}

impl JobRuntime {
    /// Create and start the underlying scheduler. Does not load any jobs;
    /// call [`restore`](JobRuntime::restore) for that.
    pub async fn start(store: Arc<JobStore>, tz: chrono_tz::Tz) -> anyhow::Result<Arc<Self>> {
        let sched = JobScheduler::new()
            .await
            .context("failed to create job scheduler")?;
        sched
            .start()
            .await
            .context("failed to start job scheduler")?;

        Ok(Arc::new(Self {
            sched,
            store,
            tz,
            job_uuids: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    /// Reload every persisted job and re-register it with the live
    /// scheduler, before any could be due.
    ///
    /// A one-shot job whose fire time elapsed while the process was down
    /// fires immediately (scheduled with zero delay). Returns the number
    /// of jobs restored. A store read failure here is fatal — the process
    /// cannot guarantee reminder durability without it.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let records = self
            .store
            .load_all()
            .context("cannot reload persisted jobs")?;

        let mut uuids = self.job_uuids.lock().await;
        for record in &records {
            if let Trigger::At(fire_at) = &record.trigger {
                if *fire_at <= Utc::now() {
                    info!(job = %record.name, due = %fire_at, "job was due while stopped, firing now");
                }
            }
            let uuid = self.add_job(record).await?;
            uuids.insert(record.name.clone(), uuid);
            debug!(job = %record.name, "restored persisted job");
        }

        Ok(records.len())
    }

    /// Register `record` with the live scheduler, removing any live job
    /// with the same name first. The store row is the caller's concern.
    pub async fn schedule(&self, record: JobRecord) -> anyhow::Result<()> {
        let mut uuids = self.job_uuids.lock().await;
        if let Some(old) = uuids.remove(&record.name) {
            if let Err(e) = self.sched.remove(&old).await {
                warn!(job = %record.name, error = %e, "failed to remove replaced live job");
            }
        }
        let name = record.name.clone();
        let uuid = self.add_job(&record).await?;
        uuids.insert(name.clone(), uuid);
        debug!(job = %name, "job registered with live scheduler");
        Ok(())
    }

    /// Remove every job exactly matching `name` from both the live
    /// scheduler and the store. Returns whether anything was removed.
    ///
    /// Best-effort with respect to an in-flight fire: a cancel racing the
    /// firing callback may not prevent that one firing.
    pub async fn cancel(&self, name: &str) -> bool {
        let live = {
            let mut uuids = self.job_uuids.lock().await;
            match uuids.remove(name) {
                Some(uuid) => {
                    if let Err(e) = self.sched.remove(&uuid).await {
                        warn!(job = %name, error = %e, "failed to remove live job");
                    }
                    true
                }
                None => false,
            }
        };

        let stored = match self.store.remove(name) {
            Ok(found) => found,
            Err(e) => {
                warn!(job = %name, error = %e, "store removal failed");
                false
            }
        };

        if live || stored {
            info!(job = %name, "job cancelled");
        }
        live || stored
    }

    /// Names of jobs currently registered with the live scheduler.
    pub async fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.job_uuids.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop the underlying scheduler.
    pub async fn shutdown(&self) {
        let mut sched = self.sched.clone();
        if let Err(e) = sched.shutdown().await {
            warn!(error = %e, "scheduler shutdown failed");
        }
    }

    /// Build the live job for `record` and add it to the scheduler.
    async fn add_job(&self, record: &JobRecord) -> anyhow::Result<uuid::Uuid> {
        let ctx = FireContext {
            record: record.clone(),
            store: self.store.clone(),
            uuids: self.job_uuids.clone(),
        };

        let job = match &record.trigger {
            Trigger::At(fire_at) => {
                let delay = (*fire_at - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                Job::new_one_shot_async(delay, move |_uuid, _lock| {
                    let ctx = ctx.clone();
                    Box::pin(async move { ctx.fire().await })
                })
                .with_context(|| format!("failed to create one-shot job {}", record.name))?
            }
            Trigger::Daily(time) => {
                // 6-field cron (sec min hour dom month dow) evaluated in
                // the configured timezone, so the alarm clock time is
                // independent of the host zone.
                let expr = format!("0 {} {} * * *", time.format("%M"), time.format("%H"));
                Job::new_async_tz(expr.as_str(), self.tz, move |_uuid, _lock| {
                    let ctx = ctx.clone();
                    Box::pin(async move { ctx.fire().await })
                })
                .with_context(|| format!("failed to create daily job {}", record.name))?
            }
        };

        self.sched
            .add(job)
            .await
            .context("failed to add job to scheduler")
    }
}

/// Everything a firing callback needs, cloned into the job closure.
/// Plain data plus store handles — nothing here is persisted.
#[derive(Clone)]
struct FireContext {
    record: JobRecord,
    store: Arc<JobStore>,
    uuids: Arc<Mutex<HashMap<String, uuid::Uuid>>>,
}

impl FireContext {
    async fn fire(&self) {
        let record = &self.record;
        info!(job = %record.name, chat = record.chat_id, "job fired");

        // Non-silent alarms get a raw platform ding before the
        // model-generated message.
        if record.kind == JobKind::Alarm && !record.silent {
            comm::deliver_text(
                record.chat_id,
                &format!("[SYSTEM]: Ding! Alarm {} is going off!", record.display_name),
            )
            .await;
        }

        let msg = comm::IncomingMessage {
            chat_id: record.chat_id,
            author: record.name.clone(),
            content: crate::reminders::fire_event_text(record),
            timestamp: Utc::now().timestamp(),
        };
        if let Err(e) = comm::sender().send(msg) {
            error!(job = %record.name, error = %e, "no receivers for fired job event");
        }

        // One-shot jobs are finished once fired; daily jobs stay scheduled
        // for the next day.
        if matches!(record.trigger, Trigger::At(_)) {
            if let Err(e) = self.store.remove(&record.name) {
                warn!(job = %record.name, error = %e, "failed to remove fired one-shot from store");
            }
            self.uuids.lock().await.remove(&record.name);
        }
    }
}
