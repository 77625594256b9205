//! # Transcription Queue
//!
//! Hand-off between the transcription source's delivery context and the
//! session's sequential consumer loop.
//!
//! - `push` never waits: the source's reader must keep draining its socket,
//!   so a full queue reports `QueueFull` instead of stalling it.
//! - `pop` waits at most `timeout`, so the consumer can notice teardown
//!   between transcripts.
//!
//! The queue is plain FIFO and does not filter; keeping interim results out is
//! the source's job.

use std::time::Duration;
use tokio::sync::mpsc;

/// One recognized segment. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

impl TranscriptEvent {
    #[cfg(test)]
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Why a push was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("transcription queue is full")]
    QueueFull,
    #[error("transcription queue is closed")]
    Closed,
}

/// Result of waiting on the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Pop {
    Event(TranscriptEvent),
    Timeout,
    /// Every producer is gone.
    Closed,
}

/// Producer half, handed to the transcription source.
#[derive(Debug, Clone)]
pub struct TranscriptSender {
    tx: mpsc::Sender<TranscriptEvent>,
}

impl TranscriptSender {
    pub fn push(&self, event: TranscriptEvent) -> Result<(), PushError> {
        self.tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PushError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }
}

/// Consumer half, owned by the session controller.
#[derive(Debug)]
pub struct TranscriptReceiver {
    rx: mpsc::Receiver<TranscriptEvent>,
}

impl TranscriptReceiver {
    pub async fn pop(&mut self, timeout: Duration) -> Pop {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => Pop::Event(event),
            Ok(None) => Pop::Closed,
            Err(_) => Pop::Timeout,
        }
    }
}

pub fn transcription_queue(capacity: usize) -> (TranscriptSender, TranscriptReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (TranscriptSender { tx }, TranscriptReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = transcription_queue(8);
        tx.push(TranscriptEvent::final_text("first")).unwrap();
        tx.push(TranscriptEvent::final_text("second")).unwrap();

        let timeout = Duration::from_millis(50);
        assert_eq!(rx.pop(timeout).await, Pop::Event(TranscriptEvent::final_text("first")));
        assert_eq!(rx.pop(timeout).await, Pop::Event(TranscriptEvent::final_text("second")));
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let (_tx, mut rx) = transcription_queue(8);
        assert_eq!(rx.pop(Duration::from_millis(20)).await, Pop::Timeout);
    }

    #[tokio::test]
    async fn test_pop_reports_closed_after_producers_drop() {
        let (tx, mut rx) = transcription_queue(8);
        drop(tx);
        assert_eq!(rx.pop(Duration::from_millis(20)).await, Pop::Closed);
    }

    #[test]
    fn test_push_never_blocks_when_full() {
        let (tx, _rx) = transcription_queue(1);
        tx.push(TranscriptEvent::final_text("one")).unwrap();
        assert_eq!(tx.push(TranscriptEvent::final_text("two")), Err(PushError::QueueFull));
    }

    #[test]
    fn test_queue_does_not_filter_interim_events() {
        let (tx, mut rx) = transcription_queue(4);
        tx.push(TranscriptEvent {
            text: "partial".into(),
            is_final: false,
        })
        .unwrap();
        let event = rx.rx.try_recv().unwrap();
        assert!(!event.is_final);
    }
}
