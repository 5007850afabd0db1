//! SubscribeTopicEvents end to end: attach, deliver, acknowledge.

use std::time::Duration;

use tonic::Code;

use courier::proto::{
    subscribe_topic_events_request, SubscribeTopicEventsRequest,
    SubscribeTopicEventsRequestProcessed, TopicEventStatus,
};

use crate::common::{initial_request, publish_request, TestRuntime, TopicStream, PUBSUB, WAIT};

#[tokio::test]
async fn test_stream_receives_published_events() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;
    let mut stream = TopicStream::attach(&mut client, "orders").await;

    client
        .publish_event(publish_request("orders", b"hello"))
        .await
        .unwrap();

    let event = stream.next_event().await;
    assert_eq!(event.data, b"hello");
    assert_eq!(event.topic, "orders");
    assert_eq!(event.pubsub_name, PUBSUB);
    assert_eq!(event.data_content_type, "text/plain");
    assert!(!event.id.is_empty());
    stream.ack(&event.id, TopicEventStatus::Success).await;

    client
        .publish_event(publish_request("orders", b"world"))
        .await
        .unwrap();

    let second = stream.next_event().await;
    assert_eq!(second.data, b"world");
    assert_ne!(second.id, event.id);
    stream.ack(&second.id, TopicEventStatus::Success).await;
}

#[tokio::test]
async fn test_retry_status_redelivers_same_event() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;
    let mut stream = TopicStream::attach(&mut client, "orders").await;

    client
        .publish_event(publish_request("orders", b"again"))
        .await
        .unwrap();

    let first = stream.next_event().await;
    stream.ack(&first.id, TopicEventStatus::Retry).await;

    let redelivered = stream.next_event().await;
    assert_eq!(redelivered.id, first.id);
    assert_eq!(redelivered.data, b"again");
    stream.ack(&redelivered.id, TopicEventStatus::Success).await;
}

#[tokio::test]
async fn test_drop_status_is_not_redelivered() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;
    let mut stream = TopicStream::attach(&mut client, "orders").await;

    client
        .publish_event(publish_request("orders", b"poison"))
        .await
        .unwrap();
    let poison = stream.next_event().await;
    stream.ack(&poison.id, TopicEventStatus::Drop).await;

    client
        .publish_event(publish_request("orders", b"next"))
        .await
        .unwrap();
    let next = stream.next_event().await;

    assert_eq!(next.data, b"next");
    assert_ne!(next.id, poison.id);
}

#[tokio::test]
async fn test_second_attach_to_same_topic_is_rejected() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;
    let _first = TopicStream::attach(&mut client, "orders").await;

    let status = TopicStream::open(&mut client, initial_request(PUBSUB, "orders"))
        .await
        .err()
        .expect("second attach must fail");

    assert_eq!(status.code(), Code::AlreadyExists);
}

#[tokio::test]
async fn test_attach_to_other_topic_is_independent() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;
    let mut orders = TopicStream::attach(&mut client, "orders").await;
    let mut invoices = TopicStream::attach(&mut client, "invoices").await;

    client
        .publish_event(publish_request("invoices", b"inv-1"))
        .await
        .unwrap();
    client
        .publish_event(publish_request("orders", b"ord-1"))
        .await
        .unwrap();

    assert_eq!(invoices.next_event().await.data, b"inv-1");
    assert_eq!(orders.next_event().await.data, b"ord-1");
}

#[tokio::test]
async fn test_first_frame_must_be_initial_request() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;

    let first = SubscribeTopicEventsRequest {
        kind: Some(subscribe_topic_events_request::Kind::EventProcessed(
            SubscribeTopicEventsRequestProcessed {
                id: "1".to_string(),
                status: TopicEventStatus::Success as i32,
            },
        )),
    };
    let status = TopicStream::open(&mut client, first)
        .await
        .err()
        .expect("attach without initial request must fail");

    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_attach_to_unknown_pubsub_fails_precondition() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;

    let status = TopicStream::open(&mut client, initial_request("kafka", "orders"))
        .await
        .err()
        .expect("attach to unknown component must fail");

    assert_eq!(status.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn test_topic_can_be_reattached_after_client_leaves() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;
    let first = TopicStream::attach(&mut client, "orders").await;
    drop(first);

    let deadline = tokio::time::Instant::now() + WAIT;
    let mut stream = loop {
        match TopicStream::open(&mut client, initial_request(PUBSUB, "orders")).await {
            Ok(mut stream) => {
                stream.next().await;
                break stream;
            }
            Err(status) if status.code() == Code::AlreadyExists => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "departed stream was never detached"
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(status) => panic!("unexpected attach failure: {status}"),
        }
    };

    client
        .publish_event(publish_request("orders", b"after reattach"))
        .await
        .unwrap();

    assert_eq!(stream.next_event().await.data, b"after reattach");
}
