//! Orchestrator Integration Tests
//!
//! End-to-end runs: messages published to the in-memory queue drive shell
//! task pipelines.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use subrun::adapters::{MemoryQueue, QueueClient, ShellRunner};
use subrun::config::Config;
use subrun::core::Orchestrator;
use subrun::domain::Disposition;
use subrun::trigger::subscription_name;

const TOPIC: &str = "git-trigger";

async fn queue() -> Arc<MemoryQueue> {
    let queue = Arc::new(MemoryQueue::new("test-project"));
    queue.create_topic(TOPIC).await.unwrap();
    queue
}

fn config(dir: &Path, tasks: &str) -> Config {
    let yaml = format!(
        "subscriptions:\n- name: build\n  dir: {}\n  trigger:\n    pubsub:\n      topic: {}\n  tasks:\n{}",
        dir.display(),
        TOPIC,
        tasks
    );
    let config = Config::from_yaml(&yaml).unwrap();
    config.check().unwrap();
    config
}

async fn start(queue: &Arc<MemoryQueue>, config: &Config) -> Orchestrator {
    let mut orchestrator = Orchestrator::new(Arc::new(ShellRunner::with_shells(["sh"])))
        .with_client_override(queue.clone());
    orchestrator.start(config).await.unwrap();
    orchestrator
}

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

fn dispositions(queue: &MemoryQueue) -> Vec<Disposition> {
    queue.dispositions().into_iter().map(|r| r.disposition).collect()
}

#[tokio::test]
async fn test_tasks_run_in_declared_order() {
    let dir = TempDir::new().unwrap();
    let queue = queue().await;
    let config = config(
        dir.path(),
        "  - cmd: printf X >> sink.txt\n  - cmd: printf Y >> sink.txt\n",
    );
    let mut orchestrator = start(&queue, &config).await;

    queue.publish(TOPIC, b"").await.unwrap();

    let sink = dir.path().join("sink.txt");
    assert!(
        wait_until(Duration::from_secs(5), || {
            std::fs::read_to_string(&sink).map(|s| s == "XY").unwrap_or(false)
        })
        .await
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_message_settled_after_every_task() {
    let dir = TempDir::new().unwrap();
    let queue = queue().await;
    let config = config(
        dir.path(),
        "  - cmd: \"true\"\n  - cmd: exit 4\n  - cmd: \"true\"\n",
    );
    let mut orchestrator = start(&queue, &config).await;

    queue.publish(TOPIC, b"payload").await.unwrap();

    assert!(wait_until(Duration::from_secs(5), || queue.dispositions().len() == 3).await);
    assert_eq!(
        dispositions(&queue),
        vec![Disposition::Ack, Disposition::Nack, Disposition::Ack]
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_timeout_then_sibling_runs() {
    let dir = TempDir::new().unwrap();
    let queue = queue().await;
    let config = config(
        dir.path(),
        "  - cmd: sleep 5\n    timeout: 200ms\n  - cmd: printf done > after.txt\n",
    );
    let mut orchestrator = start(&queue, &config).await;

    let started = Instant::now();
    queue.publish(TOPIC, b"").await.unwrap();

    let after = dir.path().join("after.txt");
    assert!(wait_until(Duration::from_secs(4), || after.exists()).await);
    assert!(started.elapsed() < Duration::from_secs(4));

    assert!(wait_until(Duration::from_secs(2), || queue.dispositions().len() == 2).await);
    assert_eq!(dispositions(&queue), vec![Disposition::Nack, Disposition::Ack]);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_pipelines_are_independent() {
    let dir = TempDir::new().unwrap();
    let queue = queue().await;
    let config = config(
        dir.path(),
        concat!(
            "  - cmd: 'p=$(cat); if [ \"$p\" = slow ]; then sleep 5; fi'\n",
            "    timeout: 1s\n",
            "  - cmd: 'p=$(cat); printf x > \"done-$p\"'\n",
        ),
    );
    let mut orchestrator = start(&queue, &config).await;

    queue.publish(TOPIC, b"slow").await.unwrap();
    queue.publish(TOPIC, b"fast").await.unwrap();

    let fast = dir.path().join("done-fast");
    let slow = dir.path().join("done-slow");

    assert!(wait_until(Duration::from_millis(900), || fast.exists()).await);
    assert!(!slow.exists());
    assert!(wait_until(Duration::from_secs(5), || slow.exists()).await);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_subscription_provisioned_once_across_restarts() {
    let dir = TempDir::new().unwrap();
    let queue = queue().await;
    let config = config(dir.path(), "  - cmd: \"true\"\n");

    let mut first = start(&queue, &config).await;
    first.shutdown().await;
    let mut second = start(&queue, &config).await;

    assert_eq!(queue.subscriptions(), vec![subscription_name("build", TOPIC)]);
    assert_eq!(second.subscriptions(), vec!["build"]);

    second.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_leaves_message_unsettled() {
    let dir = TempDir::new().unwrap();
    let queue = queue().await;
    let config = config(dir.path(), "  - cmd: printf started > started.txt; sleep 5\n");
    let mut orchestrator = start(&queue, &config).await;

    queue.publish(TOPIC, b"").await.unwrap();
    let started = dir.path().join("started.txt");
    assert!(wait_until(Duration::from_secs(5), || started.exists()).await);

    let began = Instant::now();
    orchestrator.shutdown().await;
    assert!(began.elapsed() < Duration::from_secs(2));
    assert!(orchestrator.subscriptions().is_empty());

    // The running task is killed without settling
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(queue.dispositions().is_empty());
}

#[tokio::test]
async fn test_bounded_concurrency_runs_serially() {
    let dir = TempDir::new().unwrap();
    let queue = queue().await;
    let yaml = format!(
        "max_concurrent_pipelines: 1\nsubscriptions:\n- name: build\n  dir: {}\n  trigger:\n    pubsub:\n      topic: {}\n  tasks:\n  - cmd: 'cat >> log.txt; sleep 0.1; printf . >> log.txt'\n",
        dir.path().display(),
        TOPIC
    );
    let config = Config::from_yaml(&yaml).unwrap();

    let mut orchestrator = Orchestrator::new(Arc::new(ShellRunner::with_shells(["sh"])))
        .with_client_override(queue.clone())
        .with_launcher(subrun::core::launcher_for(config.max_concurrent_pipelines));
    orchestrator.start(&config).await.unwrap();

    queue.publish(TOPIC, b"a").await.unwrap();
    queue.publish(TOPIC, b"b").await.unwrap();

    let log = dir.path().join("log.txt");
    assert!(
        wait_until(Duration::from_secs(5), || {
            std::fs::read_to_string(&log).map(|s| s.len() == 4).unwrap_or(false)
        })
        .await
    );

    // Each pipeline finishes before the next starts
    let content = std::fs::read_to_string(&log).unwrap();
    assert!(content == "a.b." || content == "b.a.", "interleaved: {}", content);

    orchestrator.shutdown().await;
}
