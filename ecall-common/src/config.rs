//! # Transport Configuration
//!
//! Frame ceilings and per-connection settings shared by clients and servers.
//! Every struct deserializes with `#[serde(default)]`, so a partial JSON
//! document overrides only the fields it names. Durations are milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default header ceiling (128 KiB).
pub const DEFAULT_MAX_HEADER_LEN: u32 = 128 * 1024;
/// Default body ceiling (2 MiB).
pub const DEFAULT_MAX_BODY_LEN: u32 = 2 * 1024 * 1024;
/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Default outbound queue depth per connection.
pub const DEFAULT_WRITE_QUEUE: usize = 100;
/// Default number of concurrently running frame handlers.
pub const DEFAULT_DISPATCH_WORKERS: usize = 1024;

/// Upper bounds for the two length fields of a frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLimits {
    pub max_header_len: u32,
    pub max_body_len: u32,
}

impl Default for FrameLimits {
    fn default() -> Self {
        FrameLimits {
            max_header_len: DEFAULT_MAX_HEADER_LEN,
            max_body_len: DEFAULT_MAX_BODY_LEN,
        }
    }
}

/// Settings applied to every connection, dialed or accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on the TCP dial.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Capacity of the outbound frame queue; senders wait when it is full.
    pub write_queue: usize,
    /// Maximum frames handled concurrently by the dispatch worker pool.
    pub dispatch_workers: usize,
    /// Frame length ceilings enforced by the receive loop.
    pub limits: FrameLimits,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_queue: DEFAULT_WRITE_QUEUE,
            dispatch_workers: DEFAULT_DISPATCH_WORKERS,
            limits: FrameLimits::default(),
        }
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
