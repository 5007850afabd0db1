//! PublishEvent validation and acceptance.

use tonic::Code;

use crate::common::{publish_request, TestRuntime};

#[tokio::test]
async fn test_publish_without_subscribers_succeeds() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;

    let response = client
        .publish_event(publish_request("orders", b"nobody listens"))
        .await;

    assert!(response.is_ok(), "publish failed: {:?}", response.err());
}

#[tokio::test]
async fn test_publish_rejects_missing_pubsub_name() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;

    let mut request = publish_request("orders", b"x");
    request.pubsub_name.clear();
    let status = client.publish_event(request).await.unwrap_err();

    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_publish_rejects_missing_topic() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;

    let status = client
        .publish_event(publish_request("", b"x"))
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("topic is empty"));
}

#[tokio::test]
async fn test_publish_rejects_unknown_pubsub() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;

    let mut request = publish_request("orders", b"x");
    request.pubsub_name = "kafka".to_string();
    let status = client.publish_event(request).await.unwrap_err();

    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("not found"));
}

#[tokio::test]
async fn test_publish_rejects_malformed_cloud_event() {
    let runtime = TestRuntime::start(None).await;
    let mut client = runtime.client().await;

    let mut request = publish_request("orders", b"{not json");
    request.data_content_type = "application/cloudevents+json".to_string();
    let status = client.publish_event(request).await.unwrap_err();

    assert_eq!(status.code(), Code::InvalidArgument);
}
