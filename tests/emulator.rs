//! Emulator Integration Tests
//!
//! Run only when PUBSUB_EMULATOR_HOST points at a running Pub/Sub emulator.

use std::sync::Arc;
use std::time::Duration;

use subrun::adapters::{ensure_topic, QueueClient};
use subrun::cli::emulator_client;
use subrun::trigger::{ensure_subscription, QueueTrigger, QueueTriggerOptions, Trigger};

#[tokio::test]
async fn test_round_trip_through_emulator() {
    let Some(client) = emulator_client() else {
        eprintln!("PUBSUB_EMULATOR_HOST not set; skipping");
        return;
    };
    let client = Arc::new(client);
    let topic = format!("subrun-test-{}", std::process::id());

    ensure_topic(client.as_ref(), &topic).await.unwrap();
    ensure_topic(client.as_ref(), &topic).await.unwrap();

    let mut trigger = QueueTrigger::start("emulator", &topic, client.clone(), QueueTriggerOptions::default())
        .await
        .unwrap();

    // Provisioning again must reuse the subscription
    let again = ensure_subscription(client.as_ref(), "emulator", &topic, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(again, trigger.subscription());

    client.publish(&topic, b"hello").await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(30), trigger.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload, b"hello");
    msg.ack();

    trigger.close();
}
