//! Event log configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::Codec;

/// Per-signal options for an [`EventLog`](super::EventLog).
///
/// Deserializes from client config such as:
///
/// ```json
/// {"delay_ms": 250, "initial_value": 0, "codec": "msgpack", "max_update_attempts": 16, "retry_delay_ms": 1000}
/// ```
///
/// Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogOptions {
    /// Artificial latency added before each publish.
    #[serde(rename = "delay_ms", with = "delay_ms")]
    pub delay: Option<Duration>,
    /// Root value until the server says otherwise.
    pub initial_value: Value,
    pub codec: Codec,
    /// Give up a contended `update` after this many attempts.
    /// Unbounded when `None`.
    pub max_update_attempts: Option<u32>,
    /// Wait before retrying a subscribe the transport refused.
    #[serde(rename = "retry_delay_ms", with = "millis")]
    pub retry_delay: Duration,
}

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

impl Default for EventLogOptions {
    fn default() -> Self {
        Self {
            delay: None,
            initial_value: Value::Null,
            codec: Codec::default(),
            max_update_attempts: None,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl EventLogOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_initial_value(mut self, value: Value) -> Self {
        self.initial_value = value;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_max_update_attempts(mut self, attempts: u32) -> Self {
        self.max_update_attempts = Some(attempts);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

mod delay_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(delay: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match delay {
            Some(delay) => serializer.serialize_some(&(delay.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn loads_from_json_config() {
        let options: EventLogOptions = serde_json::from_value(json!({
            "delay_ms": 250,
            "codec": "msgpack",
            "max_update_attempts": 3,
            "retry_delay_ms": 40
        }))
        .unwrap();

        assert_eq!(options.delay, Some(Duration::from_millis(250)));
        assert_eq!(options.codec, Codec::MessagePack);
        assert_eq!(options.max_update_attempts, Some(3));
        assert_eq!(options.retry_delay, Duration::from_millis(40));
        assert_eq!(options.initial_value, Value::Null);
    }

    #[test]
    fn empty_config_is_default() {
        let options: EventLogOptions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(options, EventLogOptions::default());

        let back = serde_json::to_value(&options).unwrap();
        assert_eq!(back["delay_ms"], Value::Null);
        assert_eq!(back["retry_delay_ms"], json!(500));
    }
}
