//! # ecall Async Client
//!
//! Purpose: Call `service.method` on a cluster of nodes over persistent,
//! multiplexed, binary-framed connections.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: [`Client`] hides discovery, balancing, pooling and
//!    response correlation.
//! 2. **Object Pool Pattern**: Connections to each node are pooled and reused.
//! 3. **Exactly-Once Completion**: Every call ends in one response or one
//!    timeout, never both.
//! 4. **Failure Isolation**: Named circuit breakers shed load from failing
//!    methods.

pub mod balancer;
pub mod breaker;
pub mod client;
pub mod discovery;
pub mod pool;
pub mod session;

pub use balancer::{BalanceError, LoadBalancer, Strategy};
pub use breaker::{Breaker, BreakerConfig, BreakerRegistry, BreakerStatus};
pub use client::{Client, ClientConfig, NodePool, ServiceClient};
pub use discovery::{DiscoveryError, NodeProvider, StaticNodes};
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolResult, Poolable};
pub use session::{PendingCall, SessionManager};

pub use ecall_common::{Format, Header, Node, Packet, RpcError, RpcResult};
