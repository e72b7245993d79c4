//! Cancellable worker task.
//!
//! A task runs its body on tokio's blocking pool. The body receives the
//! task's [`TaskControl`] and is expected to poll
//! [`TaskControl::is_cancel_requested`] between units of work. A task that
//! never gets there (typically blocked in a socket read) is escalated with
//! [`CancellableTask::kill`], which trips its [`KillSwitch`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::error::TaskError;
use crate::task::kill::KillSwitch;
use crate::task::registry::TaskRegistry;
use crate::task::state::{TaskSnapshot, TaskState};

/// State shared between a task handle, its body and the registry.
#[derive(Debug)]
pub struct TaskControl {
    name: String,
    state: Mutex<TaskState>,
    cancel: AtomicBool,
    started: OnceLock<(Instant, DateTime<Utc>)>,
    kill_switch: KillSwitch,
}

impl TaskControl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(TaskState::Created),
            cancel: AtomicBool::new(false),
            started: OnceLock::new(),
            kill_switch: KillSwitch::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask the body to stop at its next check. Non-blocking.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// The switch the body's connection should arm.
    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    /// Time since start, zero if not started.
    pub fn elapsed(&self) -> Duration {
        self.started
            .get()
            .map(|(instant, _)| instant.elapsed())
            .unwrap_or_default()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started.get().map(|(_, at)| *at)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            name: self.name.clone(),
            state: self.state(),
            started_at: self.started_at(),
            elapsed: self.elapsed(),
            cancel_requested: self.is_cancel_requested(),
        }
    }

    /// Apply a transition if the state machine allows it.
    fn transition_to(&self, target: TaskState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.can_transition_to(target) {
            return false;
        }
        let from = *state;
        tracing::debug!(task = %self.name, from = %from, to = %target, "Task transition");
        *state = target;
        true
    }
}

/// Removes a task from the registry when its body returns or unwinds.
struct Deregister {
    registry: TaskRegistry,
    control: Arc<TaskControl>,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.registry.remove(&self.control);
    }
}

/// Handle to one worker.
pub struct CancellableTask<T> {
    control: Arc<TaskControl>,
    registry: TaskRegistry,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> CancellableTask<T> {
    pub fn new(name: impl Into<String>, registry: TaskRegistry) -> Self {
        Self {
            control: Arc::new(TaskControl::new(name)),
            registry,
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        self.control.name()
    }

    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    pub fn control(&self) -> &Arc<TaskControl> {
        &self.control
    }

    /// Register the task and start running `body` on the blocking pool.
    ///
    /// Fails with [`TaskError::DuplicateName`] if a task with this name is
    /// already registered or this task was already started. Must be called
    /// from within a tokio runtime.
    pub fn start<F>(&mut self, body: F) -> Result<(), TaskError>
    where
        F: FnOnce(&TaskControl) -> T + Send + 'static,
    {
        if self.state() != TaskState::Created {
            return Err(TaskError::DuplicateName {
                name: self.name().to_string(),
            });
        }
        self.registry.register(Arc::clone(&self.control))?;

        let _ = self.control.started.set((Instant::now(), Utc::now()));
        self.control.transition_to(TaskState::Running);

        let guard = Deregister {
            registry: self.registry.clone(),
            control: Arc::clone(&self.control),
        };
        self.handle = Some(tokio::task::spawn_blocking(move || {
            let control = Arc::clone(&guard.control);
            let output = body(&control);
            let end = if control.is_cancel_requested() {
                TaskState::Cancelled
            } else {
                TaskState::Completed
            };
            // A killed task stays killed.
            control.transition_to(end);
            drop(guard);
            output
        }));

        tracing::debug!(task = %self.name(), "Task started");
        Ok(())
    }

    /// Set the cooperative cancel flag.
    pub fn request_cancel(&self) {
        self.control.request_cancel();
    }

    /// Wait up to `timeout` for the body to return.
    ///
    /// `Ok(None)` means the task is still running.
    pub async fn join(&mut self, timeout: Duration) -> Result<Option<T>, TaskError> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(TaskError::NotStarted {
                name: self.name().to_string(),
            });
        };

        let outcome = tokio::time::timeout(timeout, handle).await;
        match outcome {
            Err(_elapsed) => Ok(None),
            Ok(result) => {
                self.handle = None;
                result.map(Some).map_err(|e| TaskError::Panicked {
                    name: self.name().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Whether the body has returned (or the task was never started or
    /// has been killed).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    pub fn elapsed(&self) -> Duration {
        self.control.elapsed()
    }

    /// Forced termination.
    ///
    /// Marks the task killed, sets the cancel flag, closes the connection
    /// registered with its kill switch and stops waiting for it. The body
    /// thread cannot be stopped directly; it unwinds once its blocked call
    /// fails. Returns `false` if the task was not running.
    pub fn kill(&mut self) -> bool {
        if !self.control.transition_to(TaskState::Killed) {
            return false;
        }
        self.control.request_cancel();
        self.control.kill_switch().trip();
        self.handle.take();
        tracing::debug!(task = %self.name(), elapsed = ?self.elapsed(), "Task killed");
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn runs_to_completion_and_deregisters() {
        let registry = TaskRegistry::new();
        let mut task = CancellableTask::new("alice", registry.clone());
        assert_eq!(task.state(), TaskState::Created);

        task.start(|_| 42).unwrap();
        let output = task.join(Duration::from_secs(5)).await.unwrap();

        assert_eq!(output, Some(42));
        assert_eq!(task.state(), TaskState::Completed);
        assert!(registry.find_by_name("alice").is_none());
    }

    #[tokio::test]
    async fn second_task_with_same_name_is_rejected() {
        let registry = TaskRegistry::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let mut first = CancellableTask::new("alice", registry.clone());
        first
            .start(move |_| {
                let _ = release_rx.recv();
            })
            .unwrap();

        let mut second = CancellableTask::<()>::new("alice", registry.clone());
        let err = second.start(|_| ()).unwrap_err();
        assert!(matches!(err, TaskError::DuplicateName { .. }));
        assert_eq!(second.state(), TaskState::Created);

        release_tx.send(()).unwrap();
        first.join(Duration::from_secs(5)).await.unwrap();

        // Name is free again once the first body returned.
        let mut third = CancellableTask::new("alice", registry);
        third.start(|_| ()).unwrap();
        third.join(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn join_times_out_while_running() {
        let registry = TaskRegistry::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut task = CancellableTask::new("bob", registry);
        task.start(move |_| {
            let _ = release_rx.recv();
            "done"
        })
        .unwrap();

        assert_eq!(task.join(Duration::from_millis(20)).await.unwrap(), None);
        assert!(!task.is_finished());
        assert_eq!(task.state(), TaskState::Running);

        release_tx.send(()).unwrap();
        assert_eq!(
            task.join(Duration::from_secs(5)).await.unwrap(),
            Some("done")
        );
    }

    #[tokio::test]
    async fn cancelled_body_exits_between_units() {
        let registry = TaskRegistry::new();
        let mut task = CancellableTask::new("carol", registry);
        task.start(|control| {
            let mut units = 0;
            while !control.is_cancel_requested() && units < 1_000 {
                std::thread::sleep(Duration::from_millis(5));
                units += 1;
            }
            units
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        task.request_cancel();

        let units = task.join(Duration::from_secs(1)).await.unwrap().unwrap();
        assert!(units < 1_000);
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn kill_trips_switch_and_keeps_name_until_body_returns() {
        let registry = TaskRegistry::new();
        let (unblocked_tx, unblocked_rx) = mpsc::channel::<()>();
        let mut task = CancellableTask::new("dave", registry.clone());
        task.start(move |control| {
            // Stand-in for a blocked socket read.
            while !control.kill_switch().is_tripped() {
                std::thread::sleep(Duration::from_millis(5));
            }
            let _ = unblocked_tx.send(());
        })
        .unwrap();

        assert!(task.kill());
        assert_eq!(task.state(), TaskState::Killed);
        assert!(task.control().is_cancel_requested());
        assert!(task.is_finished());
        assert!(!task.kill());

        unblocked_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("body should unblock after kill");

        // The body's exit does not overwrite the killed state.
        for _ in 0..100 {
            if registry.find_by_name("dave").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.find_by_name("dave").is_none());
        assert_eq!(task.state(), TaskState::Killed);
    }

    #[tokio::test]
    async fn panicking_body_reports_error_and_deregisters() {
        let registry = TaskRegistry::new();
        let mut task = CancellableTask::<()>::new("erin", registry.clone());
        task.start(|_| panic!("boom")).unwrap();

        let err = task.join(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, TaskError::Panicked { .. }));
        assert!(registry.find_by_name("erin").is_none());
    }

    #[tokio::test]
    async fn join_before_start_is_an_error() {
        let mut task = CancellableTask::<()>::new("frank", TaskRegistry::new());
        assert!(matches!(
            task.join(Duration::ZERO).await,
            Err(TaskError::NotStarted { .. })
        ));
        assert_eq!(task.elapsed(), Duration::ZERO);
    }
}
