//! Delivered messages and their dispositions.
//!
//! A trigger hands each delivered item to the consumer as a [`Message`]. The
//! consumer reports the outcome with [`Message::settle`]; the settlement
//! travels back to the owning trigger over a channel, and the trigger performs
//! the actual ack/nack against the queue.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

/// Outcome reported back to the message source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed successfully; do not redeliver
    Ack,

    /// Processing failed; the source may redeliver
    Nack,
}

impl From<bool> for Disposition {
    fn from(success: bool) -> Self {
        if success {
            Self::Ack
        } else {
            Self::Nack
        }
    }
}

/// A disposition addressed to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub ack_id: String,
    pub disposition: Disposition,
}

/// Return path from a message to its trigger
#[derive(Debug, Clone)]
pub struct Acker {
    ack_id: String,
    tx: mpsc::UnboundedSender<Settlement>,
}

impl Acker {
    pub fn new(ack_id: impl Into<String>, tx: mpsc::UnboundedSender<Settlement>) -> Self {
        Self {
            ack_id: ack_id.into(),
            tx,
        }
    }

    pub fn ack_id(&self) -> &str {
        &self.ack_id
    }
}

/// One delivered unit of work
#[derive(Debug)]
pub struct Message {
    /// Identifier of the subscription this message arrived on
    pub subscription_id: String,

    /// Server-assigned message id (for logs)
    pub message_id: String,

    /// Raw payload bytes
    pub payload: Vec<u8>,

    acker: Acker,
    settled: AtomicUsize,
}

impl Message {
    pub fn new(
        subscription_id: impl Into<String>,
        message_id: impl Into<String>,
        payload: Vec<u8>,
        acker: Acker,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            message_id: message_id.into(),
            payload,
            acker,
            settled: AtomicUsize::new(0),
        }
    }

    /// Report the processing outcome to the source.
    ///
    /// May be called more than once; every call is forwarded. Sources differ
    /// in how they treat repeated dispositions for one delivery.
    pub fn settle(&self, success: bool) {
        self.settled.fetch_add(1, Ordering::SeqCst);

        let settlement = Settlement {
            ack_id: self.acker.ack_id.clone(),
            disposition: Disposition::from(success),
        };

        if self.acker.tx.send(settlement).is_err() {
            debug!(
                subscription = %self.subscription_id,
                message_id = %self.message_id,
                "trigger closed; dropping disposition"
            );
        }
    }

    pub fn ack(&self) {
        self.settle(true);
    }

    pub fn nack(&self) {
        self.settle(false);
    }

    /// Number of times [`Message::settle`] has been called
    pub fn settle_count(&self) -> usize {
        self.settled.load(Ordering::SeqCst)
    }

    pub fn ack_id(&self) -> &str {
        self.acker.ack_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_forwards_every_call() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let msg = Message::new("sub", "m-1", b"data".to_vec(), Acker::new("ack-1", tx));

        msg.nack();
        msg.ack();

        assert_eq!(msg.settle_count(), 2);
        assert_eq!(rx.try_recv().unwrap().disposition, Disposition::Nack);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.disposition, Disposition::Ack);
        assert_eq!(second.ack_id, "ack-1");
    }

    #[test]
    fn test_settle_after_close_is_harmless() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let msg = Message::new("sub", "m-1", Vec::new(), Acker::new("ack-1", tx));
        msg.ack();
        assert_eq!(msg.settle_count(), 1);
    }
}
