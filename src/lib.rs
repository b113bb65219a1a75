//! subrun - run shell tasks when messages arrive on Pub/Sub subscriptions
//!
//! Each configured subscription names a topic and an ordered list of shell
//! commands. For every message delivered on the topic, subrun runs the
//! commands in order, feeding the message payload to each one on stdin, and
//! acknowledges or rejects the message according to the outcome.
//!
//! # Architecture
//!
//! - A trigger per subscription provisions a durable queue subscription and
//!   streams delivered messages
//! - Every message gets its own pipeline; pipelines run concurrently
//! - Tasks within a pipeline run one after another, each with an optional
//!   timeout
//!
//! # Modules
//!
//! - `adapters`: External systems (shell, Pub/Sub REST, in-memory queue)
//! - `config`: YAML configuration and validation
//! - `core`: Orchestration logic (Lifetime, Pipeline, Orchestrator)
//! - `domain`: Messages and dispositions
//! - `trigger`: Message sources
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run against the configured subscriptions
//! subrun --config /etc/subrun.yaml
//!
//! # Against the emulator
//! PUBSUB_EMULATOR_HOST=localhost:8085 subrun --config subrun.yaml
//! subrun-publish git-trigger --message refs/heads/main
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod trigger;

// Re-export main types at crate root for convenience
pub use adapters::{MemoryQueue, PubSubClient, QueueClient, ShellRunner, ShellTask};
pub use config::{Config, ConfigError, Subscription};
pub use core::{Lifetime, Orchestrator};
pub use domain::{Disposition, Message};
pub use trigger::{QueueTrigger, Trigger};
