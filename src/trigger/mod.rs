//! Message sources.
//!
//! A [`Trigger`] produces a live, ordered stream of [`Message`]s until it is
//! closed. The only implementation shipped is [`QueueTrigger`], backed by a
//! queue subscription.

pub mod queue;

use async_trait::async_trait;
use thiserror::Error;

use crate::adapters::PubSubError;
use crate::domain::Message;

pub use queue::{ensure_subscription, subscription_name, QueueTrigger, QueueTriggerOptions};

/// Errors raised while starting a trigger
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("topic {topic:?} does not exist in project {project:?}")]
    TopicNotFound { project: String, topic: String },

    #[error("failed to provision subscription {subscription:?}: {source}")]
    Provision {
        subscription: String,
        #[source]
        source: PubSubError,
    },
}

/// A source of messages
#[async_trait]
pub trait Trigger: Send {
    /// Identifier of the owning subscription
    fn id(&self) -> &str;

    /// Next delivered message, or `None` once the trigger is closed
    async fn next_message(&mut self) -> Option<Message>;

    /// Stop delivering. Calling it again is a no-op.
    fn close(&mut self);
}
