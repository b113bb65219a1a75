//! Google Cloud Pub/Sub client over the v1 REST API.
//!
//! Works against the managed service and the local emulator
//! (`gcloud beta emulators pubsub start`). Message data is base64 on the wire.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::auth::TokenSource;
use super::{PubSubError, QueueClient, ReceivedMessage};
use crate::config::PubSubTriggerConfig;

/// Production REST endpoint
pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Upper bound on a single long-poll pull
const PULL_TIMEOUT: Duration = Duration::from_secs(90);

/// Timeout for every other request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const BODY_PREVIEW_LIMIT: usize = 512;

/// Pub/Sub REST client bound to one project
pub struct PubSubClient {
    base_url: String,
    project: String,
    http: reqwest::Client,
    auth: TokenSource,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceivedMessage {
    ack_id: String,
    message: WireMessage,
    #[serde(default)]
    delivery_attempt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

impl PubSubClient {
    /// Client for the given endpoint, project and token source
    pub fn with_base_url(base_url: impl Into<String>, project: impl Into<String>, auth: TokenSource) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project: project.into(),
            http: reqwest::Client::new(),
            auth,
        }
    }

    /// Unauthenticated client for the emulator at `host` (`host:port`)
    pub fn emulator(host: &str, project: &str) -> Self {
        Self::with_base_url(normalize_endpoint(host, "http"), project, TokenSource::None)
    }

    /// Client for a subscription's trigger configuration.
    ///
    /// Without a credentials file, Application Default Credentials are used.
    /// The project comes from the trigger, then the credentials file, then
    /// the metadata server.
    pub async fn connect(trigger: &PubSubTriggerConfig) -> Result<Self, PubSubError> {
        let (auth, credentials_project) = if trigger.credentials_file.is_empty() {
            TokenSource::application_default()?
        } else {
            TokenSource::from_credentials_file(Path::new(&trigger.credentials_file))?
        };

        let http = reqwest::Client::new();

        let project = if !trigger.project.is_empty() {
            trigger.project.clone()
        } else if let Some(project) = credentials_project {
            project
        } else {
            auth.discover_project(&http)
                .await?
                .ok_or(PubSubError::MissingProject)?
        };

        let base_url = if trigger.endpoint.is_empty() {
            DEFAULT_ENDPOINT.to_string()
        } else {
            normalize_endpoint(&trigger.endpoint, "https")
        };

        Ok(Self {
            base_url,
            project,
            http,
            auth,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.project, topic)
    }

    fn subscription_path(&self, subscription: &str) -> String {
        format!("projects/{}/subscriptions/{}", self.project, subscription)
    }

    /// Issue a request and decode the JSON response.
    ///
    /// 404 and 409 map to `NotFound` and `AlreadyExists` for `resource`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        resource: &str,
        timeout: Duration,
    ) -> Result<Value, PubSubError> {
        let url = format!("{}/v1/{}", self.base_url, path);

        let mut request = self.http.request(method, &url).timeout(timeout);
        if let Some(token) = self.auth.token(&self.http).await? {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|source| PubSubError::Http {
            url: url.clone(),
            source,
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|source| PubSubError::Http {
            url: url.clone(),
            source,
        })?;

        match status.as_u16() {
            404 => return Err(PubSubError::NotFound(resource.to_string())),
            409 => return Err(PubSubError::AlreadyExists(resource.to_string())),
            _ if !status.is_success() => {
                return Err(PubSubError::Status {
                    status: status.as_u16(),
                    url,
                    body: preview_body(&text),
                })
            }
            _ => {}
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text).map_err(|source| PubSubError::Decode { url, source })
    }

    async fn exists(&self, path: &str, resource: &str) -> Result<bool, PubSubError> {
        match self
            .request(Method::GET, path, None, resource, REQUEST_TIMEOUT)
            .await
        {
            Ok(_) => Ok(true),
            Err(PubSubError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl QueueClient for PubSubClient {
    fn project(&self) -> &str {
        &self.project
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, PubSubError> {
        let path = self.topic_path(topic);
        self.exists(&path, &format!("topic {}", topic)).await
    }

    async fn create_topic(&self, topic: &str) -> Result<(), PubSubError> {
        let path = self.topic_path(topic);
        self.request(
            Method::PUT,
            &path,
            Some(json!({})),
            &format!("topic {}", topic),
            REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, PubSubError> {
        let path = self.subscription_path(subscription);
        self.exists(&path, &format!("subscription {}", subscription))
            .await
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        ack_deadline: Duration,
    ) -> Result<(), PubSubError> {
        let path = self.subscription_path(subscription);
        let body = json!({
            "topic": self.topic_path(topic),
            "ackDeadlineSeconds": ack_deadline.as_secs().clamp(10, 600),
        });

        self.request(
            Method::PUT,
            &path,
            Some(body),
            &format!("subscription {}", subscription),
            REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, PubSubError> {
        let path = format!("{}:pull", self.subscription_path(subscription));
        let value = self
            .request(
                Method::POST,
                &path,
                Some(json!({ "maxMessages": max_messages })),
                &format!("subscription {}", subscription),
                PULL_TIMEOUT,
            )
            .await?;

        let response: PullResponse = if value.is_null() {
            PullResponse::default()
        } else {
            serde_json::from_value(value).map_err(|source| PubSubError::Decode {
                url: path.clone(),
                source,
            })?
        };

        response
            .received_messages
            .into_iter()
            .map(|received| {
                let data = STANDARD.decode(received.message.data.as_bytes())?;
                Ok(ReceivedMessage {
                    ack_id: received.ack_id,
                    message_id: received.message.message_id,
                    data,
                    attributes: received.message.attributes,
                    publish_time: received.message.publish_time,
                    delivery_attempt: received.delivery_attempt,
                })
            })
            .collect()
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), PubSubError> {
        if ack_ids.is_empty() {
            return Ok(());
        }

        let path = format!("{}:acknowledge", self.subscription_path(subscription));
        self.request(
            Method::POST,
            &path,
            Some(json!({ "ackIds": ack_ids })),
            &format!("subscription {}", subscription),
            REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        seconds: u32,
    ) -> Result<(), PubSubError> {
        if ack_ids.is_empty() {
            return Ok(());
        }

        let path = format!("{}:modifyAckDeadline", self.subscription_path(subscription));
        self.request(
            Method::POST,
            &path,
            Some(json!({ "ackIds": ack_ids, "ackDeadlineSeconds": seconds })),
            &format!("subscription {}", subscription),
            REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<String, PubSubError> {
        let path = format!("{}:publish", self.topic_path(topic));
        let body = json!({ "messages": [{ "data": STANDARD.encode(data) }] });

        let value = self
            .request(
                Method::POST,
                &path,
                Some(body),
                &format!("topic {}", topic),
                REQUEST_TIMEOUT,
            )
            .await?;

        let response: PublishResponse =
            serde_json::from_value(value).map_err(|source| PubSubError::Decode {
                url: path.clone(),
                source,
            })?;

        debug!(topic, ids = ?response.message_ids, "published message");

        response
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| PubSubError::Status {
                status: 200,
                url: path,
                body: "publish response carried no message id".to_string(),
            })
    }
}

fn normalize_endpoint(endpoint: &str, default_scheme: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("{}://{}", default_scheme, endpoint)
    }
}

fn preview_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    if trimmed.len() <= BODY_PREVIEW_LIMIT {
        return trimmed.to_string();
    }
    let mut end = BODY_PREVIEW_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
