//! Background scheduler.
//!
//! Idle -> Pulling -> Syncing -> Idle. Triggers arriving within the debounce
//! window collapse into one pass. Passes are not locked against manual calls
//! on the coordinator; every step is repeatable.
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};

use crate::coordinator::{PullReport, SyncCoordinator, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    AppStart,
    LocalWrite,
    ConnectivityRestored,
    Periodic,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Idle,
    Pulling,
    Syncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// 1-based pass counter for this scheduler
    pub pass: u64,
    pub trigger: SyncTrigger,
    pub pull: PullReport,
    pub sync: SyncReport,
}

pub struct SyncScheduler {
    coordinator: Arc<SyncCoordinator>,
    debounce: Duration,
    periodic: Duration,
}

impl SyncScheduler {
    pub fn new(coordinator: Arc<SyncCoordinator>, debounce: Duration, periodic: Duration) -> Self {
        Self {
            coordinator,
            debounce,
            periodic,
        }
    }

    /// Start the loop on the current runtime. An `AppStart` pass is queued
    /// immediately.
    pub fn spawn(self, online: bool) -> SchedulerHandle {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (online_tx, online_rx) = watch::channel(online);
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
        let (report_tx, report_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let _ = trigger_tx.send(SyncTrigger::AppStart);
        let task = tokio::spawn(self.run(trigger_rx, online_rx, state_tx, report_tx, shutdown_rx));

        SchedulerHandle {
            triggers: trigger_tx,
            online: online_tx,
            state: state_rx,
            last_report: report_rx,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn run(
        self,
        mut triggers: mpsc::UnboundedReceiver<SyncTrigger>,
        mut online: watch::Receiver<bool>,
        state: watch::Sender<SchedulerState>,
        reports: watch::Sender<Option<PassReport>>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.periodic);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; AppStart covers it
        ticker.tick().await;

        let mut was_online = *online.borrow();
        let mut deadline: Option<Instant> = None;
        let mut queued: Option<SyncTrigger> = None;
        let mut passes = 0u64;

        tracing::info!(debounce_ms = self.debounce.as_millis() as u64, "sync scheduler started");
        loop {
            let mut schedule = None;
            tokio::select! {
                _ = &mut shutdown => break,
                trigger = triggers.recv() => match trigger {
                    Some(t) => schedule = Some(t),
                    None => break,
                },
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_online = *online.borrow_and_update();
                    if now_online && !was_online {
                        tracing::info!("connectivity restored");
                        schedule = Some(SyncTrigger::ConnectivityRestored);
                    }
                    was_online = now_online;
                }
                _ = ticker.tick() => schedule = Some(SyncTrigger::Periodic),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    let trigger = queued.take().unwrap_or(SyncTrigger::Manual);
                    if !*online.borrow() && trigger != SyncTrigger::Manual {
                        tracing::debug!(?trigger, "offline; pass skipped");
                        continue;
                    }
                    passes += 1;
                    let report = self.run_pass(passes, trigger, &state).await;
                    reports.send_replace(Some(report));
                }
            }

            if let Some(trigger) = schedule {
                tracing::debug!(?trigger, "sync scheduled");
                deadline = Some(Instant::now() + self.debounce);
                // A manual request survives being debounced with automatic ones
                if queued != Some(SyncTrigger::Manual) {
                    queued = Some(trigger);
                }
            }
        }
        state.send_replace(SchedulerState::Idle);
        tracing::info!(passes, "sync scheduler stopped");
    }

    async fn run_pass(
        &self,
        pass: u64,
        trigger: SyncTrigger,
        state: &watch::Sender<SchedulerState>,
    ) -> PassReport {
        state.send_replace(SchedulerState::Pulling);
        let pull = self.coordinator.pull_all().await;

        state.send_replace(SchedulerState::Syncing);
        let sync = match self.coordinator.sync_pending().await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "sync pass aborted");
                SyncReport::default()
            }
        };

        state.send_replace(SchedulerState::Idle);
        PassReport {
            pass,
            trigger,
            pull,
            sync,
        }
    }
}

/// Control surface of a running scheduler
pub struct SchedulerHandle {
    triggers: mpsc::UnboundedSender<SyncTrigger>,
    online: watch::Sender<bool>,
    state: watch::Receiver<SchedulerState>,
    last_report: watch::Receiver<Option<PassReport>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request a pass; returns false once the scheduler has stopped
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        self.triggers.send(trigger).is_ok()
    }

    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    pub fn last_report(&self) -> Option<PassReport> {
        *self.last_report.borrow()
    }

    pub fn subscribe_reports(&self) -> watch::Receiver<Option<PassReport>> {
        self.last_report.clone()
    }

    /// Stop the loop and wait for an in-flight pass to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "scheduler task ended abnormally");
        }
    }
}
