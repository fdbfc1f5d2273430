use chrono::{DateTime, Local};
use std::borrow::Cow;
use std::fmt;

const PREVIEW_LEN: usize = 32;

/// A message received on one of the bridge's subscriptions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let payload = self.payload_str();
        let preview: String = payload.chars().take(PREVIEW_LEN).collect();
        let ellipsis = if payload.chars().count() > PREVIEW_LEN {
            "..."
        } else {
            ""
        };
        write!(
            f,
            "{} {}: {}{}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            preview,
            ellipsis
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_truncates_long_payloads() {
        let msg = InboundMessage::from_topic("/nefit/1/command/setmode", "x".repeat(100));
        let rendered = msg.to_string();
        assert!(rendered.contains("/nefit/1/command/setmode: "));
        assert!(rendered.ends_with(&format!("{}...", "x".repeat(PREVIEW_LEN))));
    }

    #[test]
    fn short_payloads_render_whole() {
        let msg = InboundMessage::from_topic("t", b"manual".to_vec());
        assert!(msg.to_string().ends_with("t: manual"));
        assert_eq!(msg.payload_str(), "manual");
    }
}
