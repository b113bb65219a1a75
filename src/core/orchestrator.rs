//! Subscription orchestrator.
//!
//! Starts one trigger per configured subscription and, for every message a
//! trigger delivers, launches an independent pipeline running that
//! subscription's tasks. One consumer task per trigger reads messages; the
//! pipelines themselves are started through the configured launcher.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{PubSubClient, QueueClient, ShellRunner};
use crate::config::{Config, Subscription};
use crate::trigger::{QueueTrigger, QueueTriggerOptions, Trigger};

use super::lifetime::Lifetime;
use super::pipeline::{run_pipeline, PipelineLauncher, UnboundedLauncher};

/// A running trigger consumer
struct Consumer {
    subscription: String,
    handle: JoinHandle<()>,
}

/// Runs pipelines for messages arriving on configured subscriptions
pub struct Orchestrator {
    runner: Arc<ShellRunner>,

    /// Shared connection used for every subscription instead of a
    /// per-trigger one (emulator, tests)
    client_override: Option<Arc<dyn QueueClient>>,

    launcher: Arc<dyn PipelineLauncher>,

    trigger_options: QueueTriggerOptions,

    /// Process-wide shutdown; reaches triggers and running tasks
    shutdown: Lifetime,

    consumers: Vec<Consumer>,
}

impl Orchestrator {
    /// Create an orchestrator with unbounded pipeline concurrency
    pub fn new(runner: Arc<ShellRunner>) -> Self {
        Self {
            runner,
            client_override: None,
            launcher: Arc::new(UnboundedLauncher),
            trigger_options: QueueTriggerOptions::default(),
            shutdown: Lifetime::new(),
            consumers: Vec::new(),
        }
    }

    /// Use `client` for every subscription
    pub fn with_client_override(mut self, client: Arc<dyn QueueClient>) -> Self {
        self.client_override = Some(client);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn PipelineLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_trigger_options(mut self, options: QueueTriggerOptions) -> Self {
        self.trigger_options = options;
        self
    }

    /// Lifetime cancelled by [`Orchestrator::shutdown`]
    pub fn shutdown_lifetime(&self) -> &Lifetime {
        &self.shutdown
    }

    /// Ids of subscriptions with a running consumer, in start order
    pub fn subscriptions(&self) -> Vec<&str> {
        self.consumers
            .iter()
            .map(|c| c.subscription.as_str())
            .collect()
    }

    /// Start a trigger for every subscription in `config`.
    ///
    /// Any failure is fatal: triggers already started are closed before the
    /// error is returned.
    #[instrument(skip_all)]
    pub async fn start(&mut self, config: &Config) -> Result<()> {
        for subscription in config.resolve() {
            if let Err(e) = self.start_subscription(subscription).await {
                self.shutdown().await;
                return Err(e);
            }
        }

        info!(subscriptions = self.consumers.len(), "all triggers started");
        Ok(())
    }

    async fn start_subscription(&mut self, subscription: Subscription) -> Result<()> {
        let client: Arc<dyn QueueClient> = match &self.client_override {
            Some(client) => client.clone(),
            None => Arc::new(
                PubSubClient::connect(&subscription.trigger)
                    .await
                    .with_context(|| {
                        format!("subscription {:?}: failed to connect", subscription.id)
                    })?,
            ),
        };

        let trigger = QueueTrigger::start(
            &subscription.id,
            &subscription.trigger.topic,
            client,
            self.trigger_options.clone(),
        )
        .await
        .with_context(|| format!("subscription {:?}: failed to start trigger", subscription.id))?;

        self.attach(trigger, subscription);
        Ok(())
    }

    /// Consume messages from `trigger`, running `subscription`'s tasks for
    /// each one
    pub fn attach<T>(&mut self, trigger: T, subscription: Subscription)
    where
        T: Trigger + 'static,
    {
        let id = subscription.id.clone();
        let handle = tokio::spawn(consume(
            trigger,
            Arc::new(subscription),
            self.runner.clone(),
            self.launcher.clone(),
            self.shutdown.clone(),
        ));

        self.consumers.push(Consumer {
            subscription: id,
            handle,
        });
    }

    /// Cancel running tasks, close every trigger and wait for the consumers
    /// to finish.
    ///
    /// Pipelines stopped this way leave their message unsettled.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();

        for consumer in self.consumers.drain(..) {
            if let Err(e) = consumer.handle.await {
                warn!(subscription = %consumer.subscription, error = %e, "consumer task failed");
            }
        }

        debug!("orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn consume<T: Trigger>(
    mut trigger: T,
    subscription: Arc<Subscription>,
    runner: Arc<ShellRunner>,
    launcher: Arc<dyn PipelineLauncher>,
    shutdown: Lifetime,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = trigger.next_message() => next,
        };

        let Some(message) = next else {
            break;
        };

        debug!(subscription = %subscription.id, message_id = %message.message_id, "launching pipeline");

        let subscription = subscription.clone();
        let runner = runner.clone();
        let shutdown = shutdown.clone();
        launcher.launch(Box::pin(async move {
            let report = run_pipeline(&subscription, &message, &runner, &shutdown).await;
            let failed = report.failed_tasks().count();
            if report.interrupted {
                warn!(
                    subscription = %report.subscription,
                    message_id = %report.message_id,
                    "pipeline interrupted"
                );
            } else {
                info!(
                    subscription = %report.subscription,
                    message_id = %report.message_id,
                    tasks = report.tasks.len(),
                    failed,
                    "pipeline finished"
                );
            }
        }));
    }

    trigger.close();
    debug!(subscription = %trigger.id(), "consumer stopped");
}
