//! # Async Client API
//!
//! Purpose: Issue `service.method` calls over pooled, multiplexed connections
//! and hand back responses matched by sequence number.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides discovery, balancing, pooling and
//!    correlation behind a handful of request methods.
//! 2. **Multiplexing**: A connection is acquired and released right away; the
//!    call keeps its own handle while the pool can hand the same connection
//!    to other callers. Responses find their caller through the session table.
//! 3. **One Sequence Space**: Every service on a client shares one session
//!    manager and one response dispatcher.
//! 4. **Bounded Waits**: A call waits at most for the pool's wait bound and
//!    then its own timeout.
//!
//! ## Request Flow
//!
//! ```text
//! request ─> NodeProvider::nodes ─> LoadBalancer::pick ─> pool.acquire/release
//!         ─> SessionManager::init_session ─> encode ─> Connection::send
//!
//! Connection receive loop ─> ResponseRouter ─> decode ─> SessionManager::resolve
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ecall_common::config::{ConnectionConfig, FrameLimits};
use ecall_common::connection::{Connection, Dispatcher, FrameHandler};
use ecall_common::error::{RpcError, RpcResult};
use ecall_common::protocol::{decode, encode_raw, encode_value, Packet};
use ecall_common::types::{Format, Header, Node};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::balancer::{LoadBalancer, Strategy};
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::discovery::NodeProvider;
use crate::pool::{ConnectionPool, Factory, PoolConfig};
use crate::session::{PendingCall, SessionManager};

/// Pool of connections to one `ip:port`.
pub type NodePool = ConnectionPool<Arc<Connection>>;

/// Configuration for the client, its pools and its breakers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Balancing strategy used when a call has no route key.
    pub strategy: Strategy,
    /// Serialization format for requests built by the client.
    pub format: Format,
    pub connection: ConnectionConfig,
    pub pool: PoolConfig,
    /// Thresholds for breakers created on demand by `guarded_request`.
    pub breaker: BreakerConfig,
}

/// Resolves sessions from inbound response frames.
struct ResponseRouter {
    sessions: Arc<SessionManager>,
    limits: FrameLimits,
}

impl FrameHandler for ResponseRouter {
    fn handle<'a>(&'a self, frame: Bytes, conn: Arc<Connection>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let packet = match decode(frame, &self.limits) {
                Ok(packet) => packet,
                Err(err) => {
                    warn!(peer = %conn.peer(), error = %err, "dropping undecodable response");
                    return;
                }
            };
            let header = packet.header();
            if header.seq == 0 {
                warn!(service = %header.service, method = %header.method, "response without seq");
                return;
            }
            let seq = header.seq;
            self.sessions.resolve(seq, Ok(packet));
        })
    }
}

/// Calls to one named service.
///
/// Owns the service's balancer (and so its round-robin counter) and one pool
/// per node address.
pub struct ServiceClient {
    service: String,
    config: ClientConfig,
    provider: Arc<dyn NodeProvider>,
    sessions: Arc<SessionManager>,
    dispatcher: Dispatcher,
    balancer: LoadBalancer,
    pools: Mutex<HashMap<String, Arc<OnceCell<Arc<NodePool>>>>>,
    shutdown: Arc<AtomicBool>,
}

impl ServiceClient {
    fn new(
        service: &str,
        config: ClientConfig,
        provider: Arc<dyn NodeProvider>,
        sessions: Arc<SessionManager>,
        dispatcher: Dispatcher,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        ServiceClient {
            service: service.to_string(),
            config,
            provider,
            sessions,
            dispatcher,
            balancer: LoadBalancer::new(),
            pools: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Typed call: sends `req`, waits, maps `ret`, decodes the response body.
    pub async fn request<Req, Resp>(&self, method: &str, req: &Req, timeout: Duration) -> RpcResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.request_async(method, req, timeout).await?.wait_for().await
    }

    /// Sends `req` and returns without waiting for the response.
    pub async fn request_async<Req>(&self, method: &str, req: &Req, timeout: Duration) -> RpcResult<PendingCall>
    where
        Req: Serialize + ?Sized,
    {
        let format = self.config.format;
        let body = encode_value(format, req)?;
        self.send(format, Header::new(self.service.as_str(), method), Bytes::from(body), timeout)
            .await
    }

    /// Call with a caller-built header (route key, token, trace id, ...).
    ///
    /// Returns the raw response packet; `ret` is not mapped.
    pub async fn request_with_header<Req>(
        &self,
        format: Format,
        header: Header,
        req: &Req,
        timeout: Duration,
    ) -> RpcResult<Packet>
    where
        Req: Serialize + ?Sized,
    {
        let body = encode_value(format, req)?;
        self.send(format, header, Bytes::from(body), timeout).await?.wait().await
    }

    /// Pass-through call with an already serialized body.
    pub async fn request_raw(&self, format: Format, header: Header, body: Bytes, timeout: Duration) -> RpcResult<Packet> {
        self.send(format, header, body, timeout).await?.wait().await
    }

    /// Routes, registers and writes one request.
    ///
    /// **Logic**:
    /// 1. Fetch the node list, retire pools of nodes that left it, and pick a
    ///    node (route key forces hashing).
    /// 2. Take a connection from that node's pool and put it straight back.
    /// 3. Open a session, stamp its seq into the header, frame and send.
    ///    If the frame never reaches the send queue the session is dropped.
    pub async fn send(&self, format: Format, mut header: Header, body: Bytes, timeout: Duration) -> RpcResult<PendingCall> {
        if header.service != self.service {
            return Err(RpcError::internal(format!(
                "header service {} does not match client service {}",
                header.service, self.service
            )));
        }

        self.ensure_running()?;

        let nodes = self.provider.nodes(&self.service)?;
        self.retire_departed(&nodes);
        let node = self.balancer.pick(&nodes, self.config.strategy, &header.route_key)?;
        let pool = self.pool_for(&node).await;
        if let Err(err) = self.ensure_running() {
            let _ = pool.shutdown();
            return Err(err);
        }
        let conn = pool.acquire().await?;
        pool.release(conn.clone());

        let call = self.sessions.init_session(timeout, node);
        let seq = call.seq();
        header.seq = seq;

        let frame = match encode_raw(format, &header, &body) {
            Ok(frame) => frame,
            Err(err) => {
                self.sessions.abandon(seq);
                return Err(err.into());
            }
        };
        if conn.send(frame).await.is_err() {
            self.sessions.abandon(seq);
            return Err(RpcError::internal(format!("connection to {} closed", conn.peer())));
        }

        debug!(service = %self.service, method = %header.method, seq, peer = %conn.peer(), "request sent");
        Ok(call)
    }

    fn ensure_running(&self) -> RpcResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(RpcError::internal("client has been shut down"));
        }
        Ok(())
    }

    /// Shuts down and forgets the pools of nodes missing from `nodes`.
    fn retire_departed(&self, nodes: &[Arc<Node>]) {
        let retired: Vec<(String, Arc<OnceCell<Arc<NodePool>>>)> = {
            let mut pools = self.pools.lock();
            if pools.is_empty() {
                return;
            }
            let live: HashSet<String> = nodes.iter().map(|node| node.addr()).collect();
            let departed: Vec<String> = pools.keys().filter(|addr| !live.contains(*addr)).cloned().collect();
            departed
                .into_iter()
                .filter_map(|addr| pools.remove(&addr).map(|cell| (addr, cell)))
                .collect()
        };
        for (addr, cell) in retired {
            if let Some(pool) = cell.get() {
                if pool.shutdown().is_ok() {
                    info!(service = %self.service, %addr, "retired pool of departed node");
                }
            }
        }
    }

    async fn pool_for(&self, node: &Node) -> Arc<NodePool> {
        let addr = node.addr();
        let cell = self.pools.lock().entry(addr.clone()).or_default().clone();
        cell.get_or_init(|| async {
            let pool = NodePool::new(self.config.pool.clone(), self.connection_factory(addr)).await;
            Arc::new(pool)
        })
        .await
        .clone()
    }

    fn connection_factory(&self, addr: String) -> Factory<Arc<Connection>> {
        let config = self.config.connection.clone();
        let dispatcher = self.dispatcher.clone();
        Arc::new(move || {
            let addr = addr.clone();
            let config = config.clone();
            let dispatcher = dispatcher.clone();
            Box::pin(async move { Connection::connect(&addr, &config, dispatcher).await })
        })
    }

    /// Pools created so far, keyed by `ip:port`.
    pub fn pools(&self) -> Vec<(String, Arc<NodePool>)> {
        self.pools
            .lock()
            .iter()
            .filter_map(|(addr, cell)| cell.get().map(|pool| (addr.clone(), pool.clone())))
            .collect()
    }

    fn shutdown(&self) {
        for (addr, pool) in self.pools() {
            if pool.shutdown().is_ok() {
                debug!(service = %self.service, %addr, "pool shut down");
            }
        }
    }
}

/// Front door for calls to any number of services.
///
/// Cheap to clone; clones share sessions, pools and breakers.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    provider: Arc<dyn NodeProvider>,
    sessions: Arc<SessionManager>,
    dispatcher: Dispatcher,
    breakers: BreakerRegistry,
    services: Mutex<HashMap<String, Arc<ServiceClient>>>,
    shutdown: Arc<AtomicBool>,
}

impl Client {
    /// Creates a client with default configuration.
    pub fn new(provider: Arc<dyn NodeProvider>) -> Self {
        Client::with_config(provider, ClientConfig::default())
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(provider: Arc<dyn NodeProvider>, config: ClientConfig) -> Self {
        let sessions = SessionManager::new();
        let router = ResponseRouter {
            sessions: sessions.clone(),
            limits: config.connection.limits,
        };
        let dispatcher = Dispatcher::new(Arc::new(router), config.connection.dispatch_workers);
        Client {
            inner: Arc::new(ClientInner {
                breakers: BreakerRegistry::with_defaults(config.breaker.clone()),
                config,
                provider,
                sessions,
                dispatcher,
                services: Mutex::new(HashMap::new()),
                shutdown: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Breakers used by [`Client::guarded_request`].
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.inner.breakers
    }

    /// Calls still waiting for a response or their deadline.
    pub fn pending_calls(&self) -> usize {
        self.inner.sessions.pending_count()
    }

    /// Returns the client for `service`, creating it on first use.
    pub fn service(&self, service: &str) -> Arc<ServiceClient> {
        let inner = &self.inner;
        inner
            .services
            .lock()
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(ServiceClient::new(
                    service,
                    inner.config.clone(),
                    inner.provider.clone(),
                    inner.sessions.clone(),
                    inner.dispatcher.clone(),
                    inner.shutdown.clone(),
                ))
            })
            .clone()
    }

    pub async fn request<Req, Resp>(&self, service: &str, method: &str, req: &Req, timeout: Duration) -> RpcResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.service(service).request(method, req, timeout).await
    }

    pub async fn request_async<Req>(
        &self,
        service: &str,
        method: &str,
        req: &Req,
        timeout: Duration,
    ) -> RpcResult<PendingCall>
    where
        Req: Serialize + ?Sized,
    {
        self.service(service).request_async(method, req, timeout).await
    }

    /// Routed by `header.service`.
    pub async fn request_with_header<Req>(
        &self,
        format: Format,
        header: Header,
        req: &Req,
        timeout: Duration,
    ) -> RpcResult<Packet>
    where
        Req: Serialize + ?Sized,
    {
        let service = self.service(&header.service);
        service.request_with_header(format, header, req, timeout).await
    }

    /// Routed by `header.service`; `body` is sent as is.
    pub async fn request_raw(&self, format: Format, header: Header, body: Bytes, timeout: Duration) -> RpcResult<Packet> {
        let service = self.service(&header.service);
        service.request_raw(format, header, body, timeout).await
    }

    /// [`Client::request`] behind the breaker named `service.method`.
    ///
    /// `Ok(None)` means the breaker rejected the call without sending it.
    pub async fn guarded_request<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        req: &Req,
        timeout: Duration,
    ) -> RpcResult<Option<Resp>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let name = format!("{service}.{method}");
        self.inner
            .breakers
            .call(&name, || self.request(service, method, req, timeout))
            .await
    }

    /// Shuts down every pool; later requests fail, including those to
    /// nodes or services not seen before.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let services: Vec<Arc<ServiceClient>> = self.inner.services.lock().values().cloned().collect();
        for service in services {
            service.shutdown();
        }
    }
}
