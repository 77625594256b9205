//! # Active Task Slots
//!
//! A session runs at most one response pipeline and one synthesis stream at a
//! time. Each lives in a [`TaskSlot`]: a spawned task plus the cancellation
//! token it watches at every suspension point.
//!
//! ## Locking rule:
//! Slots are guarded by a plain `std::sync::Mutex` that is only held to swap
//! the `Option`. A task is always taken out of its slot before it is awaited,
//! so no lock is ever held across an `.await`.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a task ended once it was awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    /// Ran to its end (including an early, cooperative return on cancellation)
    Finished,
    /// Did not unwind within the grace period and was aborted
    Aborted,
    Panicked,
}

/// A spawned unit of work belonging to one turn.
#[derive(Debug)]
pub struct ActiveTask {
    turn_id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ActiveTask {
    pub fn spawn<F>(turn_id: u64, cancel: CancellationToken, work: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            turn_id,
            cancel,
            handle: tokio::spawn(work),
        }
    }

    pub fn turn_id(&self) -> u64 {
        self.turn_id
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Request cooperative cancellation and wait for the task to unwind.
    ///
    /// Bounded: a task that ignores its token for longer than `grace` is
    /// aborted, so this never hangs.
    pub async fn cancel_and_wait(self, grace: Duration) -> TaskExit {
        self.cancel.cancel();
        let turn_id = self.turn_id;
        let mut handle = self.handle;

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(result) => exit_of(turn_id, result),
            Err(_) => {
                warn!(turn_id, "task ignored cancellation for {:?}, aborting", grace);
                handle.abort();
                match handle.await {
                    Ok(()) => TaskExit::Finished,
                    Err(err) if err.is_cancelled() => TaskExit::Aborted,
                    Err(_) => TaskExit::Panicked,
                }
            }
        }
    }

    /// Await a task that is expected to be done already.
    pub async fn join(self) -> TaskExit {
        let turn_id = self.turn_id;
        exit_of(turn_id, self.handle.await)
    }
}

fn exit_of(turn_id: u64, result: Result<(), tokio::task::JoinError>) -> TaskExit {
    match result {
        Ok(()) => TaskExit::Finished,
        Err(err) if err.is_cancelled() => TaskExit::Aborted,
        Err(err) => {
            warn!(turn_id, "task panicked: {}", err);
            TaskExit::Panicked
        }
    }
}

/// Holder for the single task of one kind.
#[derive(Debug)]
pub struct TaskSlot {
    name: &'static str,
    inner: Mutex<Option<ActiveTask>>,
}

impl TaskSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveTask>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while the slot holds a task that has not finished.
    pub fn is_active(&self) -> bool {
        self.lock().as_ref().map_or(false, ActiveTask::is_running)
    }

    pub fn active_turn(&self) -> Option<u64> {
        self.lock().as_ref().filter(|t| t.is_running()).map(ActiveTask::turn_id)
    }

    /// Record a new task. Returns whatever the slot held before, which the
    /// caller must await; callers clear the slot first, so it is normally `None`.
    pub fn install(&self, task: ActiveTask) -> Option<ActiveTask> {
        let previous = self.lock().replace(task);
        if let Some(prev) = &previous {
            if prev.is_running() {
                warn!(slot = self.name, turn_id = prev.turn_id, "replacing a running task");
            }
        }
        previous
    }

    pub fn take(&self) -> Option<ActiveTask> {
        self.lock().take()
    }

    /// Take the task only if it already finished.
    pub fn take_finished(&self) -> Option<ActiveTask> {
        let mut guard = self.lock();
        if guard.as_ref().map_or(false, |t| !t.is_running()) {
            guard.take()
        } else {
            None
        }
    }

    /// Cancel and await whatever the slot holds, leaving it empty.
    pub async fn cancel(&self, grace: Duration) -> Option<TaskExit> {
        let task = self.take()?;
        let turn_id = task.turn_id();
        let exit = task.cancel_and_wait(grace).await;
        debug!(slot = self.name, turn_id, ?exit, "task cancelled");
        Some(exit)
    }

    /// Await and drop a finished task, if any.
    pub async fn reap(&self) -> Option<TaskExit> {
        let task = self.take_finished()?;
        Some(task.join().await)
    }
}

/// The two slots of a session.
#[derive(Debug)]
pub struct ActiveTasks {
    pub pipeline: TaskSlot,
    pub synthesis: TaskSlot,
}

impl Default for ActiveTasks {
    fn default() -> Self {
        Self {
            pipeline: TaskSlot::new("pipeline"),
            synthesis: TaskSlot::new("synthesis"),
        }
    }
}

impl ActiveTasks {
    pub fn any_active(&self) -> bool {
        self.pipeline.is_active() || self.synthesis.is_active()
    }

    /// Clear references to tasks that already finished.
    pub async fn reap_finished(&self) {
        self.pipeline.reap().await;
        self.synthesis.reap().await;
    }

    /// Cancel both slots, pipeline first, and wait for both.
    pub async fn cancel_all(&self, grace: Duration) {
        self.pipeline.cancel(grace).await;
        self.synthesis.cancel(grace).await;
    }
}
