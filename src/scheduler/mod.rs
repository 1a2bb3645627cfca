//! Schedule generator: turns due recurring tasks into pending jobs.
//!
//! Runs on a fixed tick (plus once at startup), skips the nightly rest
//! window entirely, preloads configuration documents and active-job counts
//! in bulk, and evaluates users concurrently under a bounded worker gate.
//! A query error aborts the cycle; a per-user error is recorded without
//! blocking the other users of the same cycle.

pub mod due;
pub mod sweeper;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::cache::CoordinationStore;
use crate::config::SchedulerConfig;
use crate::models::{TaskConfigDoc, User};
use crate::store::Store;
use crate::taskmeta;
use crate::taskmeta::next_time::beijing;

/// Snapshot of the generator's most recent cycle, exposed on the ops surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GeneratorStats {
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_generated: usize,
    pub last_scanned_users: usize,
    pub last_error: Option<String>,
}

/// Handle to a spawned background loop; dropping it does NOT stop the loop,
/// call [`TaskHandle::stop`] during shutdown.
pub struct TaskHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub(crate) fn new(shutdown: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        Self { shutdown, handle }
    }

    /// Signal the loop and wait for it to finish its current cycle.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// The nightly maintenance window, Beijing local time 00:00-05:59. Cycles
/// falling inside it do nothing and touch no store.
pub fn in_rest_window(now: DateTime<Utc>) -> bool {
    let hour = now.with_timezone(&beijing()).hour();
    hour < 6
}

pub struct Generator {
    cfg: SchedulerConfig,
    store: Arc<Store>,
    cache: Arc<dyn CoordinationStore>,
    stats: Mutex<GeneratorStats>,
}

impl Generator {
    pub fn new(cfg: SchedulerConfig, store: Arc<Store>, cache: Arc<dyn CoordinationStore>) -> Self {
        Self {
            cfg,
            store,
            cache,
            stats: Mutex::new(GeneratorStats::default()),
        }
    }

    pub fn stats(&self) -> GeneratorStats {
        self.stats.lock().unwrap().clone()
    }

    /// Spawn the generation loop. The first cycle runs immediately.
    pub fn spawn(self: &Arc<Self>) -> Option<TaskHandle> {
        if !self.cfg.enabled {
            tracing::info!("schedule generator disabled");
            return None;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let generator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            generator.run(shutdown_rx).await;
        });
        Some(TaskHandle::new(shutdown_tx, handle))
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        {
            let mut stats = self.stats.lock().unwrap();
            stats.running = true;
        }
        tracing::info!(
            interval_secs = self.cfg.interval.as_secs(),
            workers = self.cfg.workers,
            "schedule generator started"
        );

        let mut ticker = tokio::time::interval(self.cfg.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    match tokio::time::timeout(self.cfg.cycle_deadline, self.run_once(now)).await {
                        Ok(()) => {}
                        Err(_) => {
                            tracing::warn!("generation cycle exceeded its deadline");
                            self.update_stats(now, 0, 0, Some("cycle deadline exceeded".into()));
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        let mut stats = self.stats.lock().unwrap();
        stats.running = false;
        tracing::info!("schedule generator stopped");
    }

    /// One generation cycle. Public so tests and ops tooling can drive it
    /// without the loop.
    pub async fn run_once(&self, now: DateTime<Utc>) {
        if in_rest_window(now) {
            self.update_stats(now, 0, 0, None);
            return;
        }

        match self.cycle(now).await {
            Ok(outcome) => {
                self.update_stats(now, outcome.generated, outcome.scanned, outcome.last_error);
            }
            Err(err) => {
                tracing::error!("generation cycle failed: {err}");
                self.update_stats(now, 0, 0, Some(err));
            }
        }
    }

    async fn cycle(&self, now: DateTime<Utc>) -> Result<CycleOutcome, String> {
        let users = self
            .store
            .active_users(now, self.cfg.scan_limit)
            .await
            .map_err(|e| e.to_string())?;
        let scanned = users.len();
        let ids: Vec<i64> = users.iter().map(|u| u.id).collect();

        let mut docs = self
            .store
            .task_configs_for_users(&ids)
            .await
            .map_err(|e| e.to_string())?;
        let counts = Arc::new(
            self.store
                .active_job_counts(&ids)
                .await
                .map_err(|e| e.to_string())?,
        );

        let gate = Arc::new(Semaphore::new(self.cfg.workers.max(1)));
        let mut tasks: JoinSet<Result<usize, String>> = JoinSet::new();

        for user in users {
            // Users without a configuration document have nothing scheduled.
            let Some(doc) = docs.remove(&user.id) else {
                continue;
            };
            let permit = match Arc::clone(&gate).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let store = Arc::clone(&self.store);
            let cache = Arc::clone(&self.cache);
            let counts = Arc::clone(&counts);
            let slot_ttl = self.cfg.slot_ttl;
            tasks.spawn(async move {
                let _permit = permit;
                process_user(store, cache, slot_ttl, user, doc, counts, now).await
            });
        }

        let mut generated = 0;
        let mut last_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(count)) => generated += count,
                Ok(Err(err)) => {
                    tracing::warn!("user evaluation failed: {err}");
                    last_error = Some(err);
                }
                Err(err) => {
                    tracing::warn!("user evaluation panicked: {err}");
                    last_error = Some(err.to_string());
                }
            }
        }

        Ok(CycleOutcome {
            scanned,
            generated,
            last_error,
        })
    }

    fn update_stats(
        &self,
        now: DateTime<Utc>,
        generated: usize,
        scanned: usize,
        error: Option<String>,
    ) {
        let mut stats = self.stats.lock().unwrap();
        stats.last_run_at = Some(now);
        stats.last_generated = generated;
        stats.last_scanned_users = scanned;
        stats.last_error = error;
    }
}

struct CycleOutcome {
    scanned: usize,
    generated: usize,
    last_error: Option<String>,
}

/// Evaluate one user's tasks: normalize the stored document, find due tasks,
/// claim their dedup slots, insert at most one job per task, and persist the
/// rewritten document once when anything changed.
async fn process_user(
    store: Arc<Store>,
    cache: Arc<dyn CoordinationStore>,
    slot_ttl: Duration,
    user: User,
    doc: TaskConfigDoc,
    counts: Arc<HashMap<(i64, String), i64>>,
    now: DateTime<Utc>,
) -> Result<usize, String> {
    let stored = doc.config;
    let mut config = taskmeta::normalize_task_config(&stored, &user.user_type);
    let mut changed = config != stored;
    let mut generated = 0;

    let task_names: Vec<String> = config.keys().cloned().collect();
    for name in task_names {
        let Some(task) = config.get(&name).and_then(Value::as_object).cloned() else {
            continue;
        };
        if task.get("enabled") != Some(&Value::Bool(true)) {
            continue;
        }
        let Some(outcome) = due::evaluate_due(&task, now, slot_ttl) else {
            continue;
        };

        let acquired = cache
            .acquire_schedule_slot(user.tenant_id, user.id, &name, &outcome.slot, outcome.dedup_ttl)
            .await
            .map_err(|e| format!("user {}: {}", user.id, e))?;
        if !acquired {
            // Another cycle or process already owns this occurrence.
            continue;
        }

        // A recurring task never gets a second concurrently-active job.
        let active = counts.get(&(user.id, name.clone())).copied().unwrap_or(0);
        if active > 0 {
            continue;
        }

        let priority = due::to_i64(task.get("priority"), 50) as i32;
        let max_attempts = due::to_i64(task.get("max_attempts"), 3) as i32;
        let payload = build_payload(&user, &task);
        store
            .create_job(
                user.tenant_id,
                user.id,
                &name,
                &Value::Object(payload),
                priority,
                max_attempts,
                now,
            )
            .await
            .map_err(|e| format!("user {}: {}", user.id, e))?;
        generated += 1;
        tracing::debug!(user_id = user.id, task = %name, slot = %outcome.slot, "job generated");

        if let Some(next) = outcome.next_time {
            let mut updated = task.clone();
            updated.insert(
                "next_time".to_string(),
                Value::String(taskmeta::next_time::format_next_time(next)),
            );
            config.insert(name.clone(), Value::Object(updated));
            changed = true;
        }
    }

    if changed {
        store
            .save_task_config(doc.id, &config, now)
            .await
            .map_err(|e| format!("user {}: {}", user.id, e))?;
    }

    Ok(generated)
}

fn build_payload(user: &User, task: &Map<String, Value>) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("user_id".to_string(), Value::from(user.id));
    payload.insert("source".to_string(), Value::from("cloud_scheduler"));
    if let Some(Value::Object(extra)) = task.get("payload") {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn rest_window_covers_beijing_midnight_to_six() {
        // 16:00 UTC == 00:00 Beijing: inside.
        assert!(in_rest_window(utc("2026-08-06T16:00:00Z")));
        // 21:59 UTC == 05:59 Beijing: still inside.
        assert!(in_rest_window(utc("2026-08-06T21:59:00Z")));
        // 22:00 UTC == 06:00 Beijing: outside.
        assert!(!in_rest_window(utc("2026-08-06T22:00:00Z")));
        // 04:00 UTC == 12:00 Beijing: outside.
        assert!(!in_rest_window(utc("2026-08-07T04:00:00Z")));
    }

    #[test]
    fn payload_merges_task_extras_over_defaults() {
        let user = User {
            id: 42,
            account_no: "acc-42".into(),
            tenant_id: 7,
            login_id: "11".into(),
            user_type: "daily".into(),
            status: "active".into(),
            username: "tester".into(),
            expires_at: None,
            notify_config: serde_json::json!({}),
        };
        let task = serde_json::json!({
            "enabled": true,
            "payload": {"difficulty": "hard", "source": "override"},
        });
        let payload = build_payload(&user, task.as_object().unwrap());
        assert_eq!(payload.get("user_id"), Some(&Value::from(42)));
        assert_eq!(payload.get("difficulty"), Some(&Value::from("hard")));
        // Task-supplied fields win over the defaults.
        assert_eq!(payload.get("source"), Some(&Value::from("override")));
    }
}
