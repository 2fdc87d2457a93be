use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the event dispatcher does after a disconnect the gateway did not ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Stay disconnected until a caller connects again.
    #[default]
    Manual,
    /// Retry in the background, `max_attempts` times, `interval` apart.
    Auto {
        max_attempts: u32,
        #[serde(with = "millis")]
        interval: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub connect_max_retries: u32,
    #[serde(with = "millis")]
    pub connect_retry_interval: Duration,
    /// Wait between the connect primitive returning and the connection check
    /// on a paired device.
    #[serde(with = "millis")]
    pub settle_delay: Duration,
    /// How long a stopping QR loop gets to exit on its own before it is
    /// cancelled.
    #[serde(with = "millis")]
    pub stop_grace: Duration,
    #[serde(with = "millis")]
    pub persistence_timeout: Duration,
    #[serde(with = "millis")]
    pub upstream_timeout: Duration,
    #[serde(with = "millis")]
    pub subscriber_timeout: Duration,
    /// Events waiting for a session's dispatcher beyond this are dropped.
    pub event_queue_capacity: usize,
    pub reconnect: ReconnectPolicy,
    pub restore_on_start: bool,
    pub default_list_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connect_max_retries: 3,
            connect_retry_interval: Duration::from_secs(10),
            settle_delay: Duration::from_secs(2),
            stop_grace: Duration::from_millis(100),
            persistence_timeout: Duration::from_secs(5),
            upstream_timeout: Duration::from_secs(30),
            subscriber_timeout: Duration::from_secs(10),
            event_queue_capacity: 1024,
            reconnect: ReconnectPolicy::Manual,
            restore_on_start: true,
            default_list_limit: 20,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
