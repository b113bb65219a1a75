//! subrun-publish: publish one message to a topic on the Pub/Sub emulator.
//!
//! Creates the topic first if it does not exist. Prints the message id.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use subrun::adapters::{ensure_topic, QueueClient};
use subrun::cli::{emulator_client, EMULATOR_HOST_ENV};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const USAGE: &str = "usage: subrun-publish <topic> --message <message>";

/// Publish a message to a Pub/Sub emulator topic
#[derive(Parser, Debug)]
#[command(name = "subrun-publish")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Topic to publish to
    topic: Option<String>,

    /// The body of the message to publish
    #[arg(short, long, default_value = "")]
    message: String,
}

impl Args {
    fn topic(&self) -> Option<&str> {
        self.topic.as_deref().filter(|t| !t.is_empty())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = Args::parse();
    let Some(topic) = args.topic() else {
        eprintln!("{}", USAGE);
        return ExitCode::FAILURE;
    };

    match run(topic, &args.message).await {
        Ok(id) => {
            println!("{}", id);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(topic: &str, message: &str) -> Result<String> {
    let client = emulator_client().with_context(|| format!("{} not set", EMULATOR_HOST_ENV))?;

    tokio::time::timeout(PUBLISH_TIMEOUT, publish(&client, topic, message))
        .await
        .context("timed out publishing message")?
}

async fn publish(client: &dyn QueueClient, topic: &str, message: &str) -> Result<String> {
    ensure_topic(client, topic)
        .await
        .context("error getting topic")?;

    client
        .publish(topic, message.as_bytes())
        .await
        .context("error publishing message")
}

#[cfg(test)]
mod tests {
    use super::*;
    use subrun::MemoryQueue;

    #[test]
    fn test_missing_topic_is_not_a_parse_error() {
        let args = Args::try_parse_from(["subrun-publish"]).unwrap();
        assert_eq!(args.topic(), None);

        let args = Args::try_parse_from(["subrun-publish", ""]).unwrap();
        assert_eq!(args.topic(), None);
    }

    #[test]
    fn test_topic_and_message() {
        let args = Args::try_parse_from(["subrun-publish", "git-trigger", "-m", "refs/heads/main"]).unwrap();
        assert_eq!(args.topic(), Some("git-trigger"));
        assert_eq!(args.message, "refs/heads/main");

        let args = Args::try_parse_from(["subrun-publish", "git-trigger"]).unwrap();
        assert_eq!(args.message, "");
    }

    #[tokio::test]
    async fn test_publish_creates_topic() {
        let queue = MemoryQueue::new("fake-project");
        let id = publish(&queue, "git-trigger", "hello").await.unwrap();
        assert!(!id.is_empty());
        assert!(queue.topic_exists("git-trigger").await.unwrap());
    }
}
