//! Trigger backed by a durable queue subscription.
//!
//! Lifecycle: `start` resolves the topic, provisions the subscription and
//! spawns two loops:
//! - receive: long-polls the subscription and forwards each delivery as a
//!   [`Message`]
//! - settle: applies the acks/nacks reported by consumers and keeps the
//!   leases of unsettled deliveries alive
//!
//! `close` cancels both loops and closes the outbound channel. Buffered but
//! unread messages are dropped unsettled and redelivered by the queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{Trigger, TriggerError};
use crate::adapters::{PubSubError, QueueClient};
use crate::core::Lifetime;
use crate::domain::{Acker, Disposition, Message, Settlement};

/// Largest ack deadline the queue service accepts, in seconds
const MAX_ACK_DEADLINE_SECS: u64 = 600;

/// Tuning knobs for a [`QueueTrigger`]
#[derive(Debug, Clone)]
pub struct QueueTriggerOptions {
    /// Ack deadline for newly created subscriptions and lease extensions
    pub ack_deadline: Duration,

    /// Deliveries requested per pull
    pub max_messages: usize,

    /// Stop extending a lease once a delivery has been held this long
    pub max_extension: Duration,

    /// Pause after a failed pull
    pub retry_backoff: Duration,

    /// Messages buffered between the receive loop and the consumer
    pub buffer: usize,
}

impl Default for QueueTriggerOptions {
    fn default() -> Self {
        Self {
            ack_deadline: Duration::from_secs(60),
            max_messages: 10,
            max_extension: Duration::from_secs(60 * 60),
            retry_backoff: Duration::from_secs(1),
            buffer: 1,
        }
    }
}

/// Subscription name used by subscription `id` for `topic`.
///
/// Stable across restarts so the same subscriber always reuses its durable
/// subscription.
pub fn subscription_name(id: &str, topic: &str) -> String {
    format!("subrun-{}-{}", id, topic)
}

/// Make sure the subscription for (`id`, `topic`) exists and return its name.
///
/// Safe to call repeatedly, and safe against a concurrent creator: an
/// "already exists" answer counts as success.
pub async fn ensure_subscription(
    client: &dyn QueueClient,
    id: &str,
    topic: &str,
    ack_deadline: Duration,
) -> Result<String, TriggerError> {
    let subscription = subscription_name(id, topic);
    let name = subscription.clone();
    let provision = move |source: PubSubError| TriggerError::Provision {
        subscription: name.clone(),
        source,
    };

    if !client.topic_exists(topic).await.map_err(&provision)? {
        return Err(TriggerError::TopicNotFound {
            project: client.project().to_string(),
            topic: topic.to_string(),
        });
    }

    if client
        .subscription_exists(&subscription)
        .await
        .map_err(&provision)?
    {
        debug!(subscription = %subscription, "reusing existing subscription");
        return Ok(subscription);
    }

    match client
        .create_subscription(&subscription, topic, ack_deadline)
        .await
    {
        Ok(()) => {
            info!(subscription = %subscription, topic = %topic, "created subscription");
            Ok(subscription)
        }
        Err(PubSubError::AlreadyExists(_)) => Ok(subscription),
        Err(PubSubError::NotFound(_)) => Err(TriggerError::TopicNotFound {
            project: client.project().to_string(),
            topic: topic.to_string(),
        }),
        Err(e) => Err(provision(e)),
    }
}

/// Unsettled deliveries, keyed by ack id, with the time they were received
type Leases = Arc<Mutex<HashMap<String, Instant>>>;

/// State shared by the receive and settle loops
#[derive(Clone)]
struct LoopContext {
    id: String,
    subscription: String,
    client: Arc<dyn QueueClient>,
    options: QueueTriggerOptions,
    lifetime: Lifetime,
    leases: Leases,
}

/// [`Trigger`] fed by a queue subscription
pub struct QueueTrigger {
    id: String,
    subscription: String,
    lifetime: Lifetime,
    rx: mpsc::Receiver<Message>,
    loops: Vec<JoinHandle<()>>,
    closed: bool,
}

impl std::fmt::Debug for QueueTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTrigger")
            .field("id", &self.id)
            .field("subscription", &self.subscription)
            .field("closed", &self.closed)
            .finish()
    }
}

impl QueueTrigger {
    /// Provision the subscription and start receiving.
    ///
    /// On error nothing is left running.
    #[instrument(skip(client, options), fields(subscription))]
    pub async fn start(
        id: &str,
        topic: &str,
        client: Arc<dyn QueueClient>,
        options: QueueTriggerOptions,
    ) -> Result<Self, TriggerError> {
        let subscription =
            ensure_subscription(client.as_ref(), id, topic, options.ack_deadline).await?;
        tracing::Span::current().record("subscription", subscription.as_str());

        let lifetime = Lifetime::new();
        let (tx, rx) = mpsc::channel(options.buffer.max(1));
        let (settle_tx, settle_rx) = mpsc::unbounded_channel();

        let ctx = LoopContext {
            id: id.to_string(),
            subscription: subscription.clone(),
            client,
            options,
            lifetime: lifetime.clone(),
            leases: Arc::new(Mutex::new(HashMap::new())),
        };

        let loops = vec![
            tokio::spawn(receive_loop(ctx.clone(), tx, settle_tx)),
            tokio::spawn(settle_loop(ctx, settle_rx)),
        ];

        info!(topic = %topic, "trigger running");

        Ok(Self {
            id: id.to_string(),
            subscription,
            lifetime,
            rx,
            loops,
            closed: false,
        })
    }

    /// Name of the underlying subscription
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl Trigger for QueueTrigger {
    fn id(&self) -> &str {
        &self.id
    }

    async fn next_message(&mut self) -> Option<Message> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.lifetime.cancel();
        // Aborting the loops releases their client handles.
        for handle in self.loops.drain(..) {
            handle.abort();
        }
        self.rx.close();

        debug!(subscription = %self.subscription, "trigger closed");
    }
}

impl Drop for QueueTrigger {
    fn drop(&mut self) {
        self.close();
    }
}

async fn receive_loop(
    ctx: LoopContext,
    tx: mpsc::Sender<Message>,
    settle_tx: mpsc::UnboundedSender<Settlement>,
) {
    loop {
        let pulled = tokio::select! {
            _ = ctx.lifetime.cancelled() => return,
            pulled = ctx.client.pull(&ctx.subscription, ctx.options.max_messages) => pulled,
        };

        let batch = match pulled {
            Ok(batch) => batch,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!(subscription = %ctx.subscription, error = %e, "pull failed; retrying");
                tokio::select! {
                    _ = ctx.lifetime.cancelled() => return,
                    _ = tokio::time::sleep(ctx.options.retry_backoff) => {}
                }
                continue;
            }
        };

        for received in batch {
            lock_leases(&ctx.leases).insert(received.ack_id.clone(), Instant::now());

            debug!(
                subscription = %ctx.id,
                message_id = %received.message_id,
                attempt = ?received.delivery_attempt,
                "message received"
            );

            let message = Message::new(
                ctx.id.clone(),
                received.message_id,
                received.data,
                Acker::new(received.ack_id, settle_tx.clone()),
            );

            tokio::select! {
                _ = ctx.lifetime.cancelled() => return,
                sent = tx.send(message) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn settle_loop(ctx: LoopContext, mut settle_rx: mpsc::UnboundedReceiver<Settlement>) {
    let period = (ctx.options.ack_deadline / 2).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = ctx.lifetime.cancelled() => return,
            Some(settlement) = settle_rx.recv() => apply_settlement(&ctx, settlement).await,
            _ = ticker.tick() => extend_leases(&ctx).await,
        }
    }
}

async fn apply_settlement(ctx: &LoopContext, settlement: Settlement) {
    lock_leases(&ctx.leases).remove(&settlement.ack_id);

    let ack_ids = [settlement.ack_id];
    let result = match settlement.disposition {
        Disposition::Ack => ctx.client.acknowledge(&ctx.subscription, &ack_ids).await,
        Disposition::Nack => {
            ctx.client
                .modify_ack_deadline(&ctx.subscription, &ack_ids, 0)
                .await
        }
    };

    if let Err(e) = result {
        // Repeat dispositions for one delivery may be refused.
        warn!(
            subscription = %ctx.subscription,
            disposition = ?settlement.disposition,
            error = %e,
            "failed to settle message"
        );
    }
}

async fn extend_leases(ctx: &LoopContext) {
    let ack_ids: Vec<String> = {
        let mut leases = lock_leases(&ctx.leases);
        leases.retain(|_, received| received.elapsed() < ctx.options.max_extension);
        leases.keys().cloned().collect()
    };

    if ack_ids.is_empty() {
        return;
    }

    let seconds = ctx
        .options
        .ack_deadline
        .as_secs()
        .clamp(1, MAX_ACK_DEADLINE_SECS) as u32;

    if let Err(e) = ctx
        .client
        .modify_ack_deadline(&ctx.subscription, &ack_ids, seconds)
        .await
    {
        debug!(subscription = %ctx.subscription, error = %e, "lease extension failed");
    }
}

fn lock_leases(leases: &Leases) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
    leases.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryQueue;

    async fn queue() -> Arc<MemoryQueue> {
        let queue = Arc::new(MemoryQueue::new("test-project"));
        queue.create_topic("git-trigger").await.unwrap();
        queue
    }

    fn fast_options() -> QueueTriggerOptions {
        QueueTriggerOptions {
            retry_backoff: Duration::from_millis(10),
            ..QueueTriggerOptions::default()
        }
    }

    #[test]
    fn test_subscription_name() {
        assert_eq!(subscription_name("build", "git-trigger"), "subrun-build-git-trigger");
    }

    #[tokio::test]
    async fn test_ensure_subscription_idempotent() {
        let queue = queue().await;
        let first = ensure_subscription(queue.as_ref(), "build", "git-trigger", Duration::from_secs(60))
            .await
            .unwrap();
        let second = ensure_subscription(queue.as_ref(), "build", "git-trigger", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.subscriptions(), vec![first]);
    }

    #[tokio::test]
    async fn test_missing_topic_fails() {
        let queue = Arc::new(MemoryQueue::new("p"));
        let err = QueueTrigger::start("build", "nope", queue, fast_options())
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::TopicNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delivers_and_acks() {
        let queue = queue().await;
        let mut trigger = QueueTrigger::start("build", "git-trigger", queue.clone(), fast_options())
            .await
            .unwrap();
        queue.publish("git-trigger", b"payload").await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), trigger.next_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.subscription_id, "build");
        assert_eq!(msg.payload, b"payload");

        msg.ack();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let records = queue.dispositions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].disposition, Disposition::Ack);
        assert_eq!(queue.outstanding(trigger.subscription()), 0);
    }

    #[tokio::test]
    async fn test_nack_redelivers() {
        let queue = queue().await;
        let mut trigger = QueueTrigger::start("build", "git-trigger", queue.clone(), fast_options())
            .await
            .unwrap();
        queue.publish("git-trigger", b"again").await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), trigger.next_message())
            .await
            .unwrap()
            .unwrap();
        first.nack();

        let second = tokio::time::timeout(Duration::from_secs(2), trigger.next_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.message_id, first.message_id);
    }

    #[tokio::test]
    async fn test_leases_extended_while_unsettled() {
        let queue = queue().await;
        let options = QueueTriggerOptions {
            ack_deadline: Duration::from_millis(100),
            ..fast_options()
        };
        let mut trigger = QueueTrigger::start("build", "git-trigger", queue.clone(), options)
            .await
            .unwrap();
        queue.publish("git-trigger", b"slow").await.unwrap();

        let _msg = tokio::time::timeout(Duration::from_secs(2), trigger.next_message())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(queue.lease_extensions() >= 1);
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let queue = queue().await;
        let mut trigger = QueueTrigger::start("build", "git-trigger", queue.clone(), fast_options())
            .await
            .unwrap();

        trigger.close();
        trigger.close();

        assert!(trigger.is_closed());
        assert!(trigger.next_message().await.is_none());
    }
}
