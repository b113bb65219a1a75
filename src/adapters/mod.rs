//! Adapters for external systems.
//!
//! - `shell`: runs task commands through a local shell interpreter
//! - `pubsub`: Google Cloud Pub/Sub (or its emulator) over the REST API
//! - `memory`: an in-process queue with the same semantics, for tests
//!
//! The queue adapters share the [`QueueClient`] trait so triggers never care
//! which one they talk to.

pub mod auth;
pub mod memory;
pub mod pubsub;
pub mod shell;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

// Re-export the adapters
pub use memory::{DispositionRecord, MemoryQueue};
pub use pubsub::PubSubClient;
pub use shell::{OutputSink, RunError, SharedBuffer, ShellRunner, ShellTask};

/// Errors returned by queue clients
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("pubsub returned status {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error("invalid response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid message data: {0}")]
    Payload(#[from] base64::DecodeError),

    #[error("credentials: {0}")]
    Credentials(String),

    #[error("no project configured and none could be discovered")]
    MissingProject,
}

impl PubSubError {
    /// Whether the request timed out client-side (normal for long polls)
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http { source, .. } if source.is_timeout())
    }
}

/// A message pulled from a subscription, not yet acknowledged
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Handle used to ack, nack or extend this delivery
    pub ack_id: String,

    pub message_id: String,

    pub data: Vec<u8>,

    pub attributes: HashMap<String, String>,

    pub publish_time: Option<DateTime<Utc>>,

    /// Delivery attempt counter, when the service tracks it
    pub delivery_attempt: Option<u32>,
}

/// Message-delivery capability of a managed queue service
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Project all topic and subscription names are resolved in
    fn project(&self) -> &str;

    async fn topic_exists(&self, topic: &str) -> Result<bool, PubSubError>;

    async fn create_topic(&self, topic: &str) -> Result<(), PubSubError>;

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, PubSubError>;

    /// Create a subscription bound to `topic`.
    ///
    /// Returns [`PubSubError::AlreadyExists`] if the name is taken.
    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        ack_deadline: Duration,
    ) -> Result<(), PubSubError>;

    /// Wait for up to `max_messages` deliveries
    async fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, PubSubError>;

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), PubSubError>;

    /// Change the ack deadline of outstanding deliveries; `0` releases them
    /// for redelivery (a nack)
    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        seconds: u32,
    ) -> Result<(), PubSubError>;

    /// Publish one message and return its server-assigned id
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<String, PubSubError>;
}

/// Get `topic`, creating it if it does not exist yet
pub async fn ensure_topic(client: &dyn QueueClient, topic: &str) -> Result<(), PubSubError> {
    if client.topic_exists(topic).await? {
        return Ok(());
    }

    match client.create_topic(topic).await {
        Ok(()) | Err(PubSubError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
