//! Typed Signals
//!
//! The public face of the engine. Each signal wraps an entry id and the
//! [`EventLog`](crate::sync::EventLog) that synchronizes it:
//!
//! - [`ValueSignal`]: any serde-serializable value
//! - [`NumberSignal`]: a `f64` with increments
//! - [`ListSignal`]: an ordered list whose items are value signals
//!
//! Reads are tracked, so reading a signal inside an
//! [`Effect`](crate::reactive::Effect) makes the effect re-run on change
//! and counts as a consumer that keeps the subscription open.

mod list;
mod number;
mod value;

pub use list::ListSignal;
pub use number::NumberSignal;
pub use value::ValueSignal;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ProtocolError, SyncError};
use crate::reactive::Effect;
use crate::state::EntryId;

/// Types a signal can hold.
pub trait SignalValue: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

impl<T> SignalValue for T where T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

/// A running observer of one or more signals.
///
/// The callback runs once immediately and again after every change.
/// Dropping the watch stops it and releases its hold on the subscription.
#[must_use = "dropping a Watch stops it"]
pub struct Watch {
    effect: Effect,
}

impl Watch {
    pub(crate) fn new(run: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            effect: Effect::new(run),
        }
    }

    /// How many times the callback has run.
    pub fn run_count(&self) -> usize {
        self.effect.run_count()
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.effect.dispose();
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("run_count", &self.run_count())
            .finish()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, SyncError> {
    serde_json::to_value(value).map_err(|error| SyncError::Protocol(ProtocolError::Json(error)))
}

/// Entry value as `T`. Missing, null and malformed values read as
/// `T::default()`; malformed ones are logged.
fn decode<T: SignalValue>(key: &EntryId, value: Option<Value>) -> T {
    let value = value.unwrap_or(Value::Null);
    let is_null = value.is_null();
    match serde_json::from_value(value) {
        Ok(decoded) => decoded,
        Err(error) => {
            if !is_null {
                tracing::warn!(entry = %key, %error, "Signal value has unexpected shape");
            }
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_falls_back_to_default() {
        let key = EntryId::root();
        assert_eq!(decode::<f64>(&key, Some(json!(2))), 2.0);
        assert_eq!(decode::<f64>(&key, None), 0.0);
        assert_eq!(decode::<f64>(&key, Some(json!("two"))), 0.0);
        assert_eq!(decode::<Option<String>>(&key, Some(Value::Null)), None);
    }

    #[test]
    fn encode_rejects_non_string_keys() {
        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], 1);
        assert!(encode(&map).is_err());
        assert_eq!(encode(&"x").unwrap(), json!("x"));
    }
}
