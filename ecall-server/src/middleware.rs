//! # Middleware Chain
//!
//! Purpose: Wrap every request in an ordered list of cross-cutting handlers
//! (monitoring, auth, ...) that ends in the method router.
//!
//! ## Design Principles
//! 1. **Immutable Chain**: The middleware list is frozen into an
//!    `Arc<[Arc<dyn Middleware>]>` when the pipeline is built; nothing is
//!    patched afterwards.
//! 2. **Index Cursor**: [`Next`] is a position in that list. Running it calls
//!    the middleware at its position with a cursor advanced by one, or the
//!    router once the list is exhausted.
//! 3. **Short-Circuit**: A middleware that returns without calling `next`
//!    answers the request itself.

use std::sync::Arc;

use bytes::Bytes;
use ecall_common::error::RpcResult;
use futures::future::BoxFuture;

use crate::router::{RequestContext, Router};

pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(&'a self, ctx: RequestContext, body: Bytes, next: Next<'a>) -> BoxFuture<'a, RpcResult<Bytes>>;
}

/// Cursor over the remaining chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    index: usize,
    router: &'a Router,
}

impl<'a> Next<'a> {
    pub fn run(self, ctx: RequestContext, body: Bytes) -> BoxFuture<'a, RpcResult<Bytes>> {
        match self.chain.get(self.index) {
            Some(middleware) => {
                let next = Next {
                    index: self.index + 1,
                    ..self
                };
                middleware.handle(ctx, body, next)
            }
            None => self.router.dispatch(ctx, body),
        }
    }
}

/// Router plus its frozen middleware chain.
pub struct Pipeline {
    router: Router,
    chain: Arc<[Arc<dyn Middleware>]>,
}

impl Pipeline {
    pub fn builder(router: Router) -> PipelineBuilder {
        PipelineBuilder {
            router,
            chain: Vec::new(),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Runs the request through every middleware and then the router.
    pub async fn call(&self, ctx: RequestContext, body: Bytes) -> RpcResult<Bytes> {
        let next = Next {
            chain: &self.chain,
            index: 0,
            router: &self.router,
        };
        next.run(ctx, body).await
    }
}

impl From<Router> for Pipeline {
    fn from(router: Router) -> Self {
        Pipeline::builder(router).build()
    }
}

pub struct PipelineBuilder {
    router: Router,
    chain: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    /// Appends `middleware`; the first one added runs outermost.
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.chain.push(middleware);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            router: self.router,
            chain: self.chain.into(),
        }
    }
}
