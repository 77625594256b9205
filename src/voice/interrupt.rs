//! # Barge-in Handling
//!
//! When the user starts speaking over a response, the response in flight has
//! to stop: the reasoning call is abandoned, synthesis stops forwarding audio,
//! and the client is told to flush its playback buffer (`interrupt`).
//!
//! ## Pieces:
//! - **InterruptionSignal**: per-session flag every pipeline stage checks at
//!   its yield points. Raised by the coordinator, cleared only by the
//!   coordinator when the next turn begins.
//! - **InterruptionCoordinator**: decides whether an incoming transcript
//!   should cancel the active response, debounces rapid re-triggers, and fans
//!   cancellation out to the pipeline and synthesis tasks.
//!
//! ## Debounce:
//! The transcription provider can finalize several segments of one utterance
//! in quick succession. Without a debounce each segment would cancel and
//! restart the response, which is audible as stutter.

use crate::voice::protocol::{PeerSink, ServerMessage};
use crate::voice::tasks::ActiveTasks;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Per-session "stop talking" flag.
#[derive(Debug, Default)]
pub struct InterruptionSignal {
    raised: AtomicBool,
}

impl InterruptionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    pub(crate) fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }
}

/// What `interrupt_if_active` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Nothing was running; nothing changed.
    Idle,
    /// A response is running but the last interruption was too recent.
    Debounced,
    /// The running response was cancelled and the client notified.
    Interrupted,
}

pub struct InterruptionCoordinator {
    debounce: Duration,
    cancel_grace: Duration,
    last_interruption: Mutex<Option<Instant>>,
    signal: Arc<InterruptionSignal>,
    tasks: Arc<ActiveTasks>,
    peer: PeerSink,
    interruptions: AtomicU64,
}

impl InterruptionCoordinator {
    pub fn new(
        debounce: Duration,
        cancel_grace: Duration,
        signal: Arc<InterruptionSignal>,
        tasks: Arc<ActiveTasks>,
        peer: PeerSink,
    ) -> Self {
        Self {
            debounce,
            cancel_grace,
            last_interruption: Mutex::new(None),
            signal,
            tasks,
            peer,
            interruptions: AtomicU64::new(0),
        }
    }

    /// Cancel the response in flight, if there is one and the debounce allows.
    ///
    /// On `Interrupted`, both task slots are empty and both tasks have
    /// finished unwinding by the time this returns.
    pub async fn interrupt_if_active(&self) -> InterruptOutcome {
        if !self.tasks.any_active() {
            return InterruptOutcome::Idle;
        }

        {
            let now = Instant::now();
            let mut last = self.last_interruption.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.debounce {
                    debug!("interruption debounced ({:?} since last)", now.duration_since(previous));
                    return InterruptOutcome::Debounced;
                }
            }
            *last = Some(now);
        }

        self.signal.raise();

        let cancelled_turn = self.tasks.pipeline.active_turn().or(self.tasks.synthesis.active_turn());
        self.tasks.pipeline.cancel(self.cancel_grace).await;
        self.tasks.synthesis.cancel(self.cancel_grace).await;

        self.interruptions.fetch_add(1, Ordering::Relaxed);
        if self.peer.send(ServerMessage::Interrupt).is_err() {
            debug!("peer gone before interrupt notice");
        }

        info!(turn_id = ?cancelled_turn, "response interrupted by new user speech");
        InterruptOutcome::Interrupted
    }

    /// Lower the signal for a turn about to start.
    pub fn begin_turn(&self) {
        self.signal.clear();
    }

    /// Cancel everything for teardown: no debounce, no `interrupt` notice.
    pub async fn shutdown(&self) {
        self.signal.raise();
        self.tasks.cancel_all(self.cancel_grace).await;
    }

    pub fn interruptions(&self) -> u64 {
        self.interruptions.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn signal(&self) -> &Arc<InterruptionSignal> {
        &self.signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::protocol::OutboundFrame;
    use crate::voice::tasks::ActiveTask;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_util::sync::CancellationToken;

    fn coordinator(
        debounce_ms: u64,
    ) -> (InterruptionCoordinator, Arc<ActiveTasks>, UnboundedReceiver<OutboundFrame>) {
        let (peer, rx) = PeerSink::channel();
        let tasks = Arc::new(ActiveTasks::default());
        let coordinator = InterruptionCoordinator::new(
            Duration::from_millis(debounce_ms),
            Duration::from_millis(500),
            Arc::new(InterruptionSignal::new()),
            tasks.clone(),
            peer,
        );
        (coordinator, tasks, rx)
    }

    fn waiting_task(turn_id: u64) -> ActiveTask {
        let token = CancellationToken::new();
        let watched = token.clone();
        ActiveTask::spawn(turn_id, token, async move { watched.cancelled().await })
    }

    fn interrupts(rx: &mut UnboundedReceiver<OutboundFrame>) -> usize {
        let mut count = 0;
        while let Ok(frame) = rx.try_recv() {
            if frame == OutboundFrame::Message(ServerMessage::Interrupt) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_idle_is_noop() {
        let (coordinator, _tasks, mut rx) = coordinator(500);
        assert_eq!(coordinator.interrupt_if_active().await, InterruptOutcome::Idle);
        assert!(!coordinator.signal().is_raised());
        assert!(coordinator.last_interruption.lock().unwrap().is_none());
        assert_eq!(interrupts(&mut rx), 0);
    }

    #[tokio::test]
    async fn test_interrupt_cancels_both_slots() {
        let (coordinator, tasks, mut rx) = coordinator(500);
        tasks.pipeline.install(waiting_task(1));
        tasks.synthesis.install(waiting_task(1));

        assert_eq!(coordinator.interrupt_if_active().await, InterruptOutcome::Interrupted);
        assert!(coordinator.signal().is_raised());
        assert!(tasks.pipeline.take().is_none());
        assert!(tasks.synthesis.take().is_none());
        assert_eq!(interrupts(&mut rx), 1);
        assert_eq!(coordinator.interruptions(), 1);
    }

    #[tokio::test]
    async fn test_second_trigger_inside_window_is_debounced() {
        let (coordinator, tasks, mut rx) = coordinator(500);
        tasks.pipeline.install(waiting_task(1));
        assert_eq!(coordinator.interrupt_if_active().await, InterruptOutcome::Interrupted);

        tokio::time::sleep(Duration::from_millis(100)).await;
        tasks.pipeline.install(waiting_task(2));
        assert_eq!(coordinator.interrupt_if_active().await, InterruptOutcome::Debounced);
        // The debounced trigger left the new task alone.
        assert!(tasks.pipeline.is_active());
        assert_eq!(interrupts(&mut rx), 1);

        tasks.cancel_all(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_triggers_outside_window_each_interrupt() {
        let (coordinator, tasks, mut rx) = coordinator(100);
        tasks.pipeline.install(waiting_task(1));
        assert_eq!(coordinator.interrupt_if_active().await, InterruptOutcome::Interrupted);

        tokio::time::sleep(Duration::from_millis(150)).await;
        tasks.pipeline.install(waiting_task(2));
        assert_eq!(coordinator.interrupt_if_active().await, InterruptOutcome::Interrupted);
        assert_eq!(interrupts(&mut rx), 2);
    }

    #[tokio::test]
    async fn test_begin_turn_clears_signal() {
        let (coordinator, tasks, _rx) = coordinator(500);
        tasks.pipeline.install(waiting_task(1));
        coordinator.interrupt_if_active().await;
        assert!(coordinator.signal().is_raised());

        coordinator.begin_turn();
        assert!(!coordinator.signal().is_raised());
    }

    #[tokio::test]
    async fn test_shutdown_sends_no_interrupt_notice() {
        let (coordinator, tasks, mut rx) = coordinator(500);
        tasks.pipeline.install(waiting_task(1));
        coordinator.shutdown().await;
        coordinator.shutdown().await;
        assert!(!tasks.any_active());
        assert_eq!(interrupts(&mut rx), 0);
    }
}
