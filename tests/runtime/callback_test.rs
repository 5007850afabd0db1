//! Push delivery to an application's AppCallback server.

use std::time::Duration;

use courier::proto::TopicEventStatus;

use crate::common::{publish_request, subscription, CallbackApp, TestRuntime, PUBSUB};

#[tokio::test]
async fn test_declared_subscription_receives_pushed_events() {
    let app = CallbackApp::new(vec![subscription("orders", None)]);
    let runtime = TestRuntime::start(Some(app.clone().serve().await)).await;
    let mut client = runtime.client().await;

    client
        .publish_event(publish_request("orders", b"pushed"))
        .await
        .unwrap();

    let events = app.wait_for("orders", 1).await;
    assert_eq!(events[0].data, b"pushed");
    assert_eq!(events[0].pubsub_name, PUBSUB);
    assert_eq!(events[0].topic, "orders");
}

#[tokio::test]
async fn test_retry_exhaustion_moves_event_to_dead_letter_topic() {
    let app = CallbackApp::new(vec![
        subscription("payments", Some("payments-dead")),
        subscription("payments-dead", None),
    ]);
    app.reply_for("payments", TopicEventStatus::Retry);
    let runtime = TestRuntime::start(Some(app.clone().serve().await)).await;
    let mut client = runtime.client().await;

    client
        .publish_event(publish_request("payments", b"declined"))
        .await
        .unwrap();

    // One delivery plus two redeliveries before giving up.
    let attempts = app.wait_for("payments", 3).await;
    assert!(attempts.iter().all(|event| event.id == attempts[0].id));

    let dead = app.wait_for("payments-dead", 1).await;
    assert_eq!(dead[0].id, attempts[0].id);
    assert_eq!(dead[0].data, b"declined");
}

#[tokio::test]
async fn test_drop_status_is_not_redelivered() {
    let app = CallbackApp::new(vec![subscription("audit", None)]);
    app.reply_for("audit", TopicEventStatus::Drop);
    let runtime = TestRuntime::start(Some(app.clone().serve().await)).await;
    let mut client = runtime.client().await;

    client
        .publish_event(publish_request("audit", b"ignored"))
        .await
        .unwrap();

    app.wait_for("audit", 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(app.received().len(), 1);
}

#[tokio::test]
async fn test_undeclared_topic_is_not_pushed() {
    let app = CallbackApp::new(vec![subscription("orders", None)]);
    let runtime = TestRuntime::start(Some(app.clone().serve().await)).await;
    let mut client = runtime.client().await;

    client
        .publish_event(publish_request("invoices", b"not for you"))
        .await
        .unwrap();
    client
        .publish_event(publish_request("orders", b"for you"))
        .await
        .unwrap();

    let events = app.wait_for("orders", 1).await;
    assert_eq!(events[0].data, b"for you");
    assert!(app.received().iter().all(|event| event.topic == "orders"));
}
