//! In-process queue with Pub/Sub delivery semantics.
//!
//! - a subscription receives every message published to its topic after the
//!   subscription was created
//! - `pull` waits until at least one message is available
//! - ack removes a delivery; nack (deadline 0) or an expired lease makes it
//!   available again
//!
//! Every ack/nack is recorded so tests can inspect dispositions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{PubSubError, QueueClient, ReceivedMessage};
use crate::domain::Disposition;

/// How often a waiting `pull` rechecks for expired leases
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One recorded ack or nack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispositionRecord {
    pub subscription: String,
    pub ack_id: String,
    /// `None` if the ack id did not match an outstanding delivery
    pub message_id: Option<String>,
    pub disposition: Disposition,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    data: Vec<u8>,
    publish_time: DateTime<Utc>,
    attempts: u32,
}

#[derive(Debug)]
struct Outstanding {
    message: StoredMessage,
    deadline: Instant,
}

#[derive(Debug)]
struct SubscriptionState {
    topic: String,
    ack_deadline: Duration,
    ready: VecDeque<StoredMessage>,
    outstanding: HashMap<String, Outstanding>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashSet<String>,
    subscriptions: HashMap<String, SubscriptionState>,
    next_message_id: u64,
    next_ack_id: u64,
    dispositions: Vec<DispositionRecord>,
    lease_extensions: usize,
}

/// In-memory [`QueueClient`]
#[derive(Debug)]
pub struct MemoryQueue {
    project: String,
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All acks and nacks received so far, in order
    pub fn dispositions(&self) -> Vec<DispositionRecord> {
        self.lock().dispositions.clone()
    }

    /// Names of all subscriptions created so far
    pub fn subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().subscriptions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Deliveries handed out and not yet acked, nacked or expired
    pub fn outstanding(&self, subscription: &str) -> usize {
        self.lock()
            .subscriptions
            .get(subscription)
            .map(|s| s.outstanding.len())
            .unwrap_or(0)
    }

    /// Number of lease extensions (non-zero deadline modifications)
    pub fn lease_extensions(&self) -> usize {
        self.lock().lease_extensions
    }

    fn try_pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, PubSubError> {
        let mut state = self.lock();
        let State {
            subscriptions,
            next_ack_id,
            ..
        } = &mut *state;

        let sub = subscriptions
            .get_mut(subscription)
            .ok_or_else(|| PubSubError::NotFound(format!("subscription {}", subscription)))?;

        let now = Instant::now();
        let expired: Vec<String> = sub
            .outstanding
            .iter()
            .filter(|(_, o)| o.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for ack_id in expired {
            if let Some(o) = sub.outstanding.remove(&ack_id) {
                sub.ready.push_back(o.message);
            }
        }

        let mut batch = Vec::new();
        while batch.len() < max_messages.max(1) {
            let Some(mut message) = sub.ready.pop_front() else {
                break;
            };
            message.attempts += 1;
            *next_ack_id += 1;
            let ack_id = format!("ack-{}", next_ack_id);

            batch.push(ReceivedMessage {
                ack_id: ack_id.clone(),
                message_id: message.message_id.clone(),
                data: message.data.clone(),
                attributes: HashMap::new(),
                publish_time: Some(message.publish_time),
                delivery_attempt: Some(message.attempts),
            });
            sub.outstanding.insert(
                ack_id,
                Outstanding {
                    message,
                    deadline: now + sub.ack_deadline,
                },
            );
        }

        Ok(batch)
    }

    fn settle(&self, subscription: &str, ack_ids: &[String], disposition: Disposition) -> Result<(), PubSubError> {
        let mut state = self.lock();
        let State {
            subscriptions,
            dispositions,
            ..
        } = &mut *state;

        let sub = subscriptions
            .get_mut(subscription)
            .ok_or_else(|| PubSubError::NotFound(format!("subscription {}", subscription)))?;

        for ack_id in ack_ids {
            let released = sub.outstanding.remove(ack_id);
            dispositions.push(DispositionRecord {
                subscription: subscription.to_string(),
                ack_id: ack_id.clone(),
                message_id: released.as_ref().map(|o| o.message.message_id.clone()),
                disposition,
            });

            if let (Disposition::Nack, Some(o)) = (disposition, released) {
                sub.ready.push_front(o.message);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    fn project(&self) -> &str {
        &self.project
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, PubSubError> {
        Ok(self.lock().topics.contains(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<(), PubSubError> {
        if !self.lock().topics.insert(topic.to_string()) {
            return Err(PubSubError::AlreadyExists(format!("topic {}", topic)));
        }
        Ok(())
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, PubSubError> {
        Ok(self.lock().subscriptions.contains_key(subscription))
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        ack_deadline: Duration,
    ) -> Result<(), PubSubError> {
        let mut state = self.lock();
        if !state.topics.contains(topic) {
            return Err(PubSubError::NotFound(format!("topic {}", topic)));
        }
        if state.subscriptions.contains_key(subscription) {
            return Err(PubSubError::AlreadyExists(format!(
                "subscription {}",
                subscription
            )));
        }

        state.subscriptions.insert(
            subscription.to_string(),
            SubscriptionState {
                topic: topic.to_string(),
                ack_deadline,
                ready: VecDeque::new(),
                outstanding: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, PubSubError> {
        loop {
            let notified = self.notify.notified();

            let batch = self.try_pull(subscription, max_messages)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), PubSubError> {
        self.settle(subscription, ack_ids, Disposition::Ack)
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        seconds: u32,
    ) -> Result<(), PubSubError> {
        if seconds == 0 {
            self.settle(subscription, ack_ids, Disposition::Nack)?;
            self.notify.notify_waiters();
            return Ok(());
        }

        let mut state = self.lock();
        let State {
            subscriptions,
            lease_extensions,
            ..
        } = &mut *state;

        let sub = subscriptions
            .get_mut(subscription)
            .ok_or_else(|| PubSubError::NotFound(format!("subscription {}", subscription)))?;

        let deadline = Instant::now() + Duration::from_secs(u64::from(seconds));
        for ack_id in ack_ids {
            if let Some(o) = sub.outstanding.get_mut(ack_id) {
                o.deadline = deadline;
                *lease_extensions += 1;
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<String, PubSubError> {
        let message_id = {
            let mut state = self.lock();
            if !state.topics.contains(topic) {
                return Err(PubSubError::NotFound(format!("topic {}", topic)));
            }

            state.next_message_id += 1;
            let message = StoredMessage {
                message_id: state.next_message_id.to_string(),
                data: data.to_vec(),
                publish_time: Utc::now(),
                attempts: 0,
            };

            for sub in state.subscriptions.values_mut().filter(|s| s.topic == topic) {
                sub.ready.push_back(message.clone());
            }
            message.message_id
        };

        self.notify.notify_waiters();
        Ok(message_id)
    }
}
