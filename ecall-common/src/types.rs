//! # Call Metadata Types
//!
//! Core data types carried by every call: the serialization format tag, the
//! message header, and the node record describing one service instance.
//!
//! ## Design Principles
//!
//! 1. **Header Independence**: The header is serialized on its own so it can
//!    be inspected (and routed on) without touching the body.
//!
//! 2. **Stable Field Names**: Header fields keep their camelCase wire names in
//!    both formats, so MessagePack maps and JSON objects carry identical keys.
//!
//! 3. **Shared Load Signal**: `Node::active` is a single atomic counter shared
//!    by every session routed to the node; least-active balancing reads it
//!    without locking.
//!
//! ## Header Layout (logical)
//!
//! ```text
//! +---------+--------+----------+-------+-----+-----------+---------+-----+-----+-----+
//! | service | method | routeKey | token | uid | requestIp | traceId | seq | ret | msg |
//! +---------+--------+----------+-------+-----+-----------+---------+-----+-----+-----+
//! | str     | str    | str      | str   | u64 | str       | str     | u64 | i32 | str |
//! +---------+--------+----------+-------+-----+-----------+---------+-----+-----+-----+
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Serialization format tag carried in byte 1 of every frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Compact binary (MessagePack with named fields).
    #[default]
    MsgPack = 0,
    /// UTF-8 JSON.
    Json = 1,
}

impl Format {
    /// Returns the wire byte for this format.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire byte, returning `None` for unknown formats.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Format::MsgPack),
            1 => Some(Format::Json),
            _ => None,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::MsgPack => f.write_str("msgpack"),
            Format::Json => f.write_str("json"),
        }
    }
}

/// Header attached to every request and echoed on every response.
///
/// `seq` is assigned by the client and must come back unchanged; `ret` and
/// `msg` are filled in by the server (0 / empty on success).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Header {
    /// Target service (resource) name.
    pub service: String,
    /// Method within the service.
    pub method: String,
    /// Optional sticky-routing key; non-empty forces hash balancing.
    pub route_key: String,
    /// Opaque auth credential.
    pub token: String,
    /// Caller user id.
    pub uid: u64,
    /// Originating client address.
    pub request_ip: String,
    /// Distributed trace id.
    pub trace_id: String,
    /// Correlation sequence number.
    pub seq: u64,
    /// Result code, 0 on success.
    pub ret: i32,
    /// Human-readable error detail.
    pub msg: String,
}

impl Header {
    /// Builds a header addressed at `service.method`.
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Header {
            service: service.into(),
            method: method.into(),
            ..Header::default()
        }
    }

    pub fn with_route_key(mut self, route_key: impl Into<String>) -> Self {
        self.route_key = route_key.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_uid(mut self, uid: u64) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_request_ip(mut self, request_ip: impl Into<String>) -> Self {
        self.request_ip = request_ip.into();
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Sets the result code and message, used by servers to report failures.
    pub fn with_result(mut self, ret: i32, msg: impl Into<String>) -> Self {
        self.ret = ret;
        self.msg = msg.into();
        self
    }

    /// Returns true when the remote reported success.
    pub fn is_ok(&self) -> bool {
        self.ret == 0
    }
}

/// One addressable service instance.
///
/// Nodes are handed out as `Arc<Node>` by the node-list provider so that the
/// `active` counter survives across routing decisions.
#[derive(Debug, Serialize, Deserialize)]
pub struct Node {
    pub ip: String,
    pub port: u16,
    /// Relative weight for weighted-random balancing.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// In-flight calls currently routed to this node.
    #[serde(skip)]
    active: AtomicI64,
}

fn default_weight() -> u32 {
    1
}

impl Node {
    /// Creates a node with zero in-flight calls.
    pub fn new(ip: impl Into<String>, port: u16, weight: u32) -> Self {
        Node {
            ip: ip.into(),
            port,
            weight,
            active: AtomicI64::new(0),
        }
    }

    /// Pool identity: `ip:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Current in-flight call count.
    pub fn active(&self) -> i64 {
        self.active.load(Ordering::Acquire)
    }

    pub fn incr_active(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decr_active(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Clone for Node {
    /// Clones the address and weight; the copy starts with its own counter.
    fn clone(&self) -> Self {
        Node::new(self.ip.clone(), self.port, self.weight)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port && self.weight == other.weight
    }
}

impl Eq for Node {}
