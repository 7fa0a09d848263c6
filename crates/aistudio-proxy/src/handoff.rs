//! Hand-off queue from the proxy to the streaming consumer.
//!
//! Pushes never block a connection: a slow or absent consumer costs events,
//! not forwarding throughput.

use tokio::sync::mpsc::{self, error::TrySendError};

use aistudio_core::QueueMessage;

/// Producer side of the hand-off queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HandoffQueue {
    tx: mpsc::Sender<QueueMessage>,
}

impl HandoffQueue {
    /// Creates a bounded queue, returning the producer and the consumer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<QueueMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Wraps an existing sender.
    pub fn from_sender(tx: mpsc::Sender<QueueMessage>) -> Self {
        Self { tx }
    }

    /// Pushes a message without waiting. Returns whether it was enqueued.
    pub fn push(&self, message: impl Into<QueueMessage>) -> bool {
        match self.tx.try_send(message.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                tracing::warn!("Hand-off queue full, dropping {}", describe(&message));
                false
            }
            Err(TrySendError::Closed(message)) => {
                tracing::debug!("Hand-off queue closed, dropping {}", describe(&message));
                false
            }
        }
    }

    /// Announces that the listener is accepting connections.
    pub fn push_ready(&self) -> bool {
        self.push(QueueMessage::Ready)
    }
}

fn describe(message: &QueueMessage) -> &'static str {
    match message {
        QueueMessage::Ready => "ready signal",
        QueueMessage::Event(_) => "parsed event",
        QueueMessage::UpstreamError(_) => "upstream error event",
    }
}
