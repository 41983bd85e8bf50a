//! # ecall Server
//!
//! Purpose: Serve one service over the ecall frame protocol, routing each
//! request by method name through a middleware pipeline.
//!
//! ## Design Principles
//! 1. **Registry Pattern**: Handlers are registered on a [`Router`] by method
//!    name before the server starts.
//! 2. **Chain of Responsibility**: Middleware wraps the router in a fixed
//!    order; any link may answer early.
//! 3. **Fault Containment**: A panicking handler answers `ERROR_INTERNAL` and
//!    leaves the connection serving.

pub mod metrics;
pub mod middleware;
pub mod router;
pub mod server;

pub use metrics::{CallMonitor, LogSink, MetricsSnapshot, MonitorSink};
pub use middleware::{Middleware, Next, Pipeline, PipelineBuilder};
pub use router::{BoxedHandler, RequestContext, Router};
pub use server::{Server, ServerConfig};
