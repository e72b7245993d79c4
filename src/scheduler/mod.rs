//! Polling scheduler: one worker per account per cycle, supervised.
//!
//! Each cycle loads the rules, partitions them into work groups, starts a
//! [`CancellableTask`] per group and supervises the set until it drains:
//! finished workers are joined, workers running past the hang threshold are
//! killed. Cycles never overlap. A stop request cancels the active workers,
//! waits out the grace period and kills whatever is left.

pub mod state;

pub use state::{CycleReport, SchedulerState};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::TaskError;
use crate::filter::{AccountReport, FilterEngine};
use crate::rules::{RuleStore, WorkGroup};
use crate::task::{CancellableTask, TaskRegistry};

/// Upper bound on collecting the output of a worker that already finished.
const JOIN_FINISHED: Duration = Duration::from_secs(1);

type Worker = CancellableTask<AccountReport>;

/// Requests a graceful stop of a running [`Scheduler`].
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        if !self.tx.send_replace(true) {
            info!("Scheduler stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn RuleStore>,
    engine: Arc<FilterEngine>,
    registry: TaskRegistry,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn RuleStore>, engine: Arc<FilterEngine>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            config,
            store,
            engine,
            registry: TaskRegistry::new(),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            state: Mutex::new(SchedulerState::Idle),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Workers currently registered, including killed ones still unwinding.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SchedulerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Run cycles until stopped.
    pub async fn run(&self) {
        info!(
            "Scheduler started, polling every {}s (hang threshold {}s)",
            self.config.poll_interval.as_secs(),
            self.config.hang_threshold.as_secs()
        );
        let mut stop = self.stop_rx.clone();

        while !self.stop_requested() {
            self.set_state(SchedulerState::Running);
            self.run_cycle().await;
            if self.stop_requested() {
                break;
            }

            self.set_state(SchedulerState::Sleeping);
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = stop.wait_for(|stopped| *stopped) => {}
            };
        }

        self.set_state(SchedulerState::Stopped);
        info!("Scheduler stopped");
    }

    /// One complete cycle: load, dispatch, supervise until drained.
    pub async fn run_cycle(&self) -> CycleReport {
        let span = tracing::info_span!("cycle", id = %Uuid::new_v4());
        self.cycle().instrument(span).await
    }

    async fn cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let rules = match self.store.get_all_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                error!("Failed to load rules, skipping cycle: {e}");
                return report;
            }
        };
        if rules.is_empty() {
            info!("No rules configured");
            return report;
        }

        let groups = WorkGroup::partition(rules);
        report.accounts = groups.len();
        let active = self.dispatch(groups, &mut report);
        self.supervise(active, &mut report).await;

        info!(
            accounts = report.accounts,
            completed = report.completed,
            failed = report.failed,
            cancelled = report.cancelled,
            killed = report.killed,
            skipped = report.skipped,
            moved = report.moved,
            "Cycle complete"
        );
        report
    }

    fn dispatch(&self, groups: Vec<WorkGroup>, report: &mut CycleReport) -> Vec<Worker> {
        let mut active = Vec::with_capacity(groups.len());
        for group in groups {
            let mut task = Worker::new(group.user(), self.registry.clone());
            let engine = Arc::clone(&self.engine);
            match task.start(move |control| engine.run_group(&group, control)) {
                Ok(()) => active.push(task),
                Err(e) => {
                    error!("Skipping account this cycle: {e}");
                    report.skipped += 1;
                }
            }
        }
        debug!(workers = active.len(), "Workers dispatched");
        active
    }

    async fn supervise(&self, mut active: Vec<Worker>, report: &mut CycleReport) {
        let mut stop = self.stop_rx.clone();
        let mut tick = tokio::time::interval(self.config.supervise_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !active.is_empty() {
            // The watch guard must not live across an await.
            let stopping = tokio::select! {
                _ = tick.tick() => false,
                _ = stop.wait_for(|stopped| *stopped) => true,
            };
            if stopping {
                self.shutdown(active, report).await;
                return;
            }
            active = self.reap(active, report).await;
        }
    }

    /// Join finished workers and kill hung ones. Returns the rest.
    async fn reap(&self, active: Vec<Worker>, report: &mut CycleReport) -> Vec<Worker> {
        let mut running = Vec::with_capacity(active.len());

        for mut task in active {
            if task.is_finished() {
                match task.join(JOIN_FINISHED).await {
                    Ok(Some(account)) => report.record(&account),
                    Ok(None) => running.push(task),
                    Err(e) => {
                        error!("{e}");
                        report.failed += 1;
                    }
                }
                continue;
            }

            let elapsed = task.elapsed();
            if elapsed > self.config.hang_threshold && task.kill() {
                let hung = TaskError::Hung {
                    name: task.name().to_string(),
                    elapsed,
                };
                error!("{hung}, killed");
                report.killed += 1;
                continue;
            }
            running.push(task);
        }

        if !running.is_empty() {
            debug!(tasks = ?self.registry.enumerate(), "Workers still running");
        }
        running
    }

    async fn shutdown(&self, active: Vec<Worker>, report: &mut CycleReport) {
        let cancelled = self.registry.cancel_all();
        info!(
            workers = cancelled,
            tasks = ?self.registry.enumerate(),
            "Stop requested, cancelling workers"
        );

        let deadline = Instant::now() + self.config.shutdown_grace;
        for mut task in active {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match task.join(remaining).await {
                Ok(Some(account)) => report.record(&account),
                Ok(None) if task.kill() => {
                    warn!(task = %task.name(), "Worker ignored cancellation, killed");
                    report.killed += 1;
                }
                Ok(None) => {
                    if let Ok(Some(account)) = task.join(JOIN_FINISHED).await {
                        report.record(&account);
                    }
                }
                Err(e) => {
                    error!("{e}");
                    report.failed += 1;
                }
            }
        }
    }
}
