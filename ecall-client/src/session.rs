//! # Session Manager
//!
//! Purpose: Correlate each outgoing call with its asynchronous response (or
//! its deadline) by sequence number.
//!
//! ## Design Principles
//! 1. **Resolve Once**: Response arrival and deadline expiry both go through
//!    `resolve`, which removes the entry under the table's write lock. Only
//!    the caller that removes the entry can deliver, and the one-shot sender
//!    is consumed by value, so a session completes exactly once.
//! 2. **Silent Misses**: A late or duplicate response finds no entry and is
//!    dropped with a debug log.
//! 3. **Load Accounting**: `Node::active` goes up when a session opens and
//!    down when it is removed, whichever path removes it.
//!
//! ## Session Lifecycle
//!
//! ```text
//! init_session ──> pending ──resolve(response)──> completed
//!                     │
//!                     └──deadline──> resolve(Timeout) ──> completed
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ecall_common::error::{RpcError, RpcResult};
use ecall_common::protocol::Packet;
use ecall_common::types::Node;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

struct Session {
    tx: oneshot::Sender<RpcResult<Packet>>,
    node: Arc<Node>,
    timer: JoinHandle<()>,
}

/// Sequence-number keyed table of in-flight calls.
pub struct SessionManager {
    sessions: RwLock<HashMap<u64, Session>>,
    next_seq: AtomicU64,
}

impl Default for SessionManager {
    fn default() -> Self {
        SessionManager {
            sessions: RwLock::new(HashMap::new()),
            // 0 marks a header whose seq was never set.
            next_seq: AtomicU64::new(1),
        }
    }
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionManager::default())
    }

    /// Opens a session routed to `node` that times out after `timeout`.
    pub fn init_session(self: &Arc<Self>, timeout: Duration, node: Arc<Node>) -> PendingCall {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        node.incr_active();

        // The timer is spawned under the write lock, so it cannot look the
        // entry up before it exists.
        let mut sessions = self.sessions.write();
        let manager: Weak<SessionManager> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                if manager.complete(seq, Err(RpcError::Timeout), false) {
                    debug!(seq, "session timed out");
                }
            }
        });
        sessions.insert(seq, Session { tx, node, timer });

        PendingCall { seq, rx }
    }

    /// Delivers `outcome` to the session `seq`.
    ///
    /// Returns false when no such session is pending (already completed,
    /// timed out, or never existed).
    pub fn resolve(&self, seq: u64, outcome: RpcResult<Packet>) -> bool {
        let found = self.complete(seq, outcome, true);
        if !found {
            debug!(seq, "no pending session, dropping response");
        }
        found
    }

    /// Removes a session without delivering anything, e.g. when its request
    /// never made it onto the wire.
    pub fn abandon(&self, seq: u64) -> bool {
        let removed = self.sessions.write().remove(&seq);
        match removed {
            Some(session) => {
                session.node.decr_active();
                session.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Number of sessions still waiting.
    pub fn pending_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_pending(&self, seq: u64) -> bool {
        self.sessions.read().contains_key(&seq)
    }

    fn complete(&self, seq: u64, outcome: RpcResult<Packet>, stop_timer: bool) -> bool {
        let removed = self.sessions.write().remove(&seq);
        let Some(session) = removed else {
            return false;
        };
        session.node.decr_active();
        if stop_timer {
            session.timer.abort();
        }
        // The caller may have stopped waiting; that is not an error.
        let _ = session.tx.send(outcome);
        true
    }
}

/// Handle to one in-flight call.
#[derive(Debug)]
pub struct PendingCall {
    seq: u64,
    rx: oneshot::Receiver<RpcResult<Packet>>,
}

impl PendingCall {
    /// Sequence number written into the request header.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Waits for the response or the deadline, whichever comes first.
    pub async fn wait(self) -> RpcResult<Packet> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::internal("session dropped before completion")),
        }
    }

    /// Waits, then maps the response's result code and decodes its body.
    pub async fn wait_for<T: serde::de::DeserializeOwned>(self) -> RpcResult<T> {
        self.wait().await?.into_result()
    }
}
