//! Background reminder monitor for policy due dates.
//!
//! [`ReminderMonitor`] scans the policy store on a fixed interval and
//! raises a [`ReminderEvent`] for every policy whose due date falls in
//! `[today, today + lead_days]` and that has not been notified for that
//! date yet. Events are logged and broadcast to subscribers.
//!
//! Exactly-once delivery comes from the store: a reminder is emitted only
//! by the scan whose conditional update flips `notified` from 0 to 1.
//! A loop tick and an on-demand check racing on the same policy therefore
//! cannot both notify it.
//!
//! Each policy is re-read right before it is evaluated, so a policy
//! deleted while a scan is running is skipped by that scan.
//!
//! The loop runs as one tokio task. A `watch` channel carries the stop
//! signal. A tick that has started always runs to completion, and the
//! stop signal is observed at the next loop boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Utc};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::MonitorConfig;
use crate::error::KbResult;
use crate::models::ReminderEvent;
use crate::policy::PolicyStore;

const EVENT_BUFFER: usize = 100;

struct RunningLoop {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ReminderMonitor {
    store: Arc<PolicyStore>,
    interval: Duration,
    lead_days: u64,
    events: broadcast::Sender<ReminderEvent>,
    control: Mutex<Option<RunningLoop>>,
}

impl ReminderMonitor {
    pub fn new(store: Arc<PolicyStore>, interval: Duration, lead_days: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store,
            interval,
            lead_days,
            events,
            control: Mutex::new(None),
        }
    }

    pub fn from_config(store: Arc<PolicyStore>, config: &MonitorConfig) -> Self {
        Self::new(
            store,
            Duration::from_secs(config.poll_interval_secs),
            config.lead_days.max(0) as u64,
        )
    }

    /// Receive every reminder emitted from now on, by the loop or by
    /// on-demand checks.
    pub fn subscribe(&self) -> broadcast::Receiver<ReminderEvent> {
        self.events.subscribe()
    }

    /// Start the poll loop. The first scan runs immediately. Returns
    /// `false` if the loop was already running.
    pub async fn start(&self) -> bool {
        let mut control = self.control.lock().await;
        if control.as_ref().is_some_and(|l| !l.task.is_finished()) {
            return false;
        }

        let (stop, mut stop_rx) = watch::channel(false);
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let period = self.interval;
        let lead_days = self.lead_days;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {
                        if let Err(e) = scan(&store, &events, Utc::now(), lead_days).await {
                            tracing::error!(error = %e, "reminder scan failed");
                        }
                    }
                }
            }
            tracing::debug!("reminder loop exited");
        });

        *control = Some(RunningLoop { stop, task });
        tracing::info!(
            interval_secs = period.as_secs(),
            lead_days,
            "reminder monitor started"
        );
        true
    }

    /// Stop the poll loop and wait for it to exit. An in-flight scan
    /// completes first. Returns `false` if the loop was not running.
    pub async fn stop(&self) -> bool {
        let running = self.control.lock().await.take();
        let Some(running) = running else {
            return false;
        };
        let _ = running.stop.send(true);
        if let Err(e) = running.task.await {
            tracing::warn!(error = %e, "reminder loop ended abnormally");
        }
        tracing::info!("reminder monitor stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.control
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| !l.task.is_finished())
    }

    /// Run one scan now. Does not need the loop and does not touch its
    /// timer.
    pub async fn check_reminders_now(&self) -> KbResult<Vec<ReminderEvent>> {
        self.check_reminders_at(Utc::now()).await
    }

    /// Run one scan as if the current time were `now`.
    pub async fn check_reminders_at(&self, now: DateTime<Utc>) -> KbResult<Vec<ReminderEvent>> {
        scan(&self.store, &self.events, now, self.lead_days).await
    }
}

async fn scan(
    store: &PolicyStore,
    events: &broadcast::Sender<ReminderEvent>,
    now: DateTime<Utc>,
    lead_days: u64,
) -> KbResult<Vec<ReminderEvent>> {
    let today = now.date_naive();
    let window_end = today.checked_add_days(Days::new(lead_days)).unwrap_or(today);
    let mut emitted = Vec::new();

    for name in store.unnotified_names().await? {
        let policy = match store.get(&name).await {
            Ok(Some(p)) => p,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(policy = %name, error = %e, "skipping policy");
                continue;
            }
        };
        let Some(due_date) = policy.due_date else {
            continue;
        };
        if policy.notified {
            continue;
        }

        let step = async {
            if due_date < today || due_date > window_end {
                store.touch_checked(&name, now).await?;
                return Ok(None);
            }
            if !store.mark_notified(&name, due_date, now).await? {
                return Ok(None);
            }
            Ok::<_, crate::error::KbError>(Some(ReminderEvent {
                policy: name.clone(),
                due_date,
                days_remaining: (due_date - today).num_days(),
            }))
        };

        match step.await {
            Ok(Some(event)) => {
                tracing::info!(
                    policy = %event.policy,
                    due_date = %event.due_date,
                    days_remaining = event.days_remaining,
                    "payment reminder"
                );
                let _ = events.send(event.clone());
                emitted.push(event);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(policy = %name, error = %e, "reminder check failed"),
        }
    }

    Ok(emitted)
}
