use serde_json::Value;

use crate::events::GenerationEvent;

pub const CONTENT_TYPE: &str = "text/event-stream";

/// Response headers that keep reverse proxies from buffering the stream.
pub const STREAM_HEADERS: [(&str, &str); 3] = [
    ("Cache-Control", "no-cache"),
    ("X-Accel-Buffering", "no"),
    ("Connection", "keep-alive"),
];

/// `event: <type>\ndata: <json>\n\n`
pub fn encode_frame(event: &GenerationEvent) -> String {
    let data = Value::Object(event.payload());
    format!("event: {}\ndata: {}\n\n", event.event_type(), data)
}

/// Parse a single frame back into `(event type, data)`.
pub fn decode_frame(frame: &str) -> Option<(String, Value)> {
    let mut event_type = None;
    let mut data = None;
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_type = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data = serde_json::from_str::<Value>(rest.trim()).ok();
        }
    }
    Some((event_type?, data?))
}
