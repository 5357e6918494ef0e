use serde::{Deserialize, Deserializer, Serialize};

/// Event carrying browser text bound for the upstream link.
pub const CLIENT_DATA_EVENT: &str = "clientData";

/// Event carrying a raw upstream chunk to the browser.
pub const MESSAGE_EVENT: &str = "message";

/// Named event envelope exchanged as a WebSocket text frame.
///
/// `data` is opaque to the relay: upstream chunks go out verbatim and browser
/// payloads are forwarded without inspection. A non-string `data` from a
/// browser is taken as its JSON text, so `42` forwards as `42`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(deserialize_with = "data_as_text")]
    pub data: String,
}

fn data_as_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    })
}

impl EventFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}
