//! One dispatch loop firing registered cron schedules.
//!
//! Callbacks return a future that the engine spawns on its own tracker, so a
//! slow trigger never delays the next fire.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{CicdError, Result};

pub type EntryId = u64;

/// Invoked with the scheduled fire time.
pub type CronCallback = Arc<dyn Fn(DateTime<Utc>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`CronCallback`].
pub fn callback<F, Fut>(f: F) -> CronCallback
where
    F: Fn(DateTime<Utc>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |at| f(at).boxed())
}

struct Entry {
    expression: String,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
    callback: CronCallback,
}

/// Parse a 6/7-field expression; 5-field expressions get a `0` seconds field.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| CicdError::Validation(format!("invalid cron expression '{expression}': {e}")))
}

#[derive(Default)]
pub struct CronEngine {
    entries: Mutex<BTreeMap<EntryId, Entry>>,
    next_id: AtomicU64,
    wake: Notify,
    tracker: TaskTracker,
}

impl CronEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, expression: &str, callback: CronCallback) -> Result<EntryId> {
        let schedule = parse_schedule(expression)?;
        let next = schedule.upcoming(Utc).next();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(
            id,
            Entry {
                expression: expression.trim().to_string(),
                schedule,
                next,
                callback,
            },
        );
        self.wake.notify_one();
        Ok(id)
    }

    pub fn remove(&self, id: EntryId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            self.wake.notify_one();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_fire(&self, id: EntryId) -> Option<DateTime<Utc>> {
        self.lock().get(&id).and_then(|e| e.next)
    }

    pub fn expression(&self, id: EntryId) -> Option<String> {
        self.lock().get(&id).map(|e| e.expression.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<EntryId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take every entry due at `now`, advancing each to its next fire time.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, CronCallback)> {
        let mut due = Vec::new();
        let mut entries = self.lock();
        for entry in entries.values_mut() {
            if let Some(at) = entry.next.filter(|at| *at <= now) {
                due.push((at, entry.callback.clone()));
                entry.next = entry.schedule.after(&now).next();
            }
        }
        entries.retain(|_, e| e.next.is_some());
        due
    }

    fn earliest(&self) -> Option<DateTime<Utc>> {
        self.lock().values().filter_map(|e| e.next).min()
    }

    /// Dispatch loop. Returns when `cancel` fires, after in-flight callbacks finish.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(entries = self.len(), "Cron engine started");
        loop {
            let wait = self
                .earliest()
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => continue,
                _ = sleep_for(wait) => {}
            }

            for (fired_at, callback) in self.take_due(Utc::now()) {
                self.tracker.spawn(callback(fired_at));
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Cron engine stopped");
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
