// Generalizes the shape of submerge-txn's old Config{nodes,retries,
// timeout}: a small, Clone-able, serde-able bag of knobs the coordinator
// consults rather than hardcoding.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one `ClientBehavior` instance. All fields have defaults
/// chosen to be safe rather than fast; callers running at scale are
/// expected to override them.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long to wait before retrying a resolver that failed or timed
    /// out.
    #[serde(with = "duration_secs")]
    pub resolver_retry_delay: Duration,

    /// Maximum requests buffered on a `Connecting`/`Reconnecting`
    /// connection before `enqueue` reports `QueueOverflow`.
    pub connecting_queue_ceiling: usize,

    /// Fallback transmit window used if a `BackendInfoResolver` doesn't
    /// grant a more specific one.
    pub max_outstanding_default: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            resolver_retry_delay: Duration::from_secs(5),
            connecting_queue_ceiling: 256,
            max_outstanding_default: 32,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
