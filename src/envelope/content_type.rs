//! Content-type classification for event payloads.

/// CloudEvents structured-mode JSON content type.
pub const CLOUD_EVENT_CONTENT_TYPE: &str = "application/cloudevents+json";

/// Media type without parameters, lowercased.
fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Payloads carried as text: `text/*` and XML types.
pub fn is_string_content_type(content_type: &str) -> bool {
    let media = media_type(content_type);
    media.starts_with("text/") || media.ends_with("/xml") || media.ends_with("+xml")
}

/// Payloads carried as embedded JSON: `application/json` and `*+json`.
pub fn is_json_content_type(content_type: &str) -> bool {
    let media = media_type(content_type);
    media == "application/json" || media.ends_with("+json")
}

/// Opaque payloads that travel base64-encoded.
pub fn is_binary_content_type(content_type: &str) -> bool {
    media_type(content_type) == "application/octet-stream"
}

/// The application already built a CloudEvent.
pub fn is_cloud_event_content_type(content_type: &str) -> bool {
    media_type(content_type) == CLOUD_EVENT_CONTENT_TYPE
}
