//! # Method Router
//!
//! Purpose: Map method names of one service to handlers, populated once at
//! startup.
//!
//! ## Design Principles
//! 1. **Explicit Registry**: Every callable method is registered by name; there
//!    is no lookup by introspection.
//! 2. **Typed Edges**: Typed handlers never see bytes. The router decodes the
//!    request body and encodes the response in the request's format.
//! 3. **Pass-Through Option**: Raw handlers receive and return body bytes
//!    untouched, for relays.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use ecall_common::error::{RpcError, RpcResult, ERROR_BAD_REQUEST, ERROR_METHOD_NOT_FOUND};
use ecall_common::protocol::{decode_value, encode_value};
use ecall_common::types::{Format, Header};
use futures::future::{self, BoxFuture};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Per-request metadata handed to middleware and handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub header: Header,
    pub format: Format,
    pub peer: SocketAddr,
    pub received_at: Instant,
}

impl RequestContext {
    pub fn new(header: Header, format: Format, peer: SocketAddr) -> Self {
        RequestContext {
            header,
            format,
            peer,
            received_at: Instant::now(),
        }
    }

    pub fn method(&self) -> &str {
        &self.header.method
    }
}

/// Type-erased handler: request body in, response body out.
pub type BoxedHandler = Arc<dyn Fn(RequestContext, Bytes) -> BoxFuture<'static, RpcResult<Bytes>> + Send + Sync>;

/// Method table for one service.
pub struct Router {
    service: String,
    routes: HashMap<String, BoxedHandler>,
}

impl Router {
    pub fn new(service: impl Into<String>) -> Self {
        Router {
            service: service.into(),
            routes: HashMap::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Registers a typed handler for `method`.
    ///
    /// A body that does not decode as `Req` is answered with
    /// `ERROR_BAD_REQUEST` without calling the handler.
    pub fn route<Req, Resp, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Resp>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: BoxedHandler = Arc::new(move |ctx: RequestContext, body: Bytes| {
            let handler = handler.clone();
            let fut: BoxFuture<'static, RpcResult<Bytes>> = Box::pin(async move {
                let format = ctx.format;
                let req: Req = decode_value(format, &body)
                    .map_err(|err| RpcError::system(ERROR_BAD_REQUEST, format!("decode request: {err}")))?;
                let resp = handler(ctx, req).await?;
                Ok(Bytes::from(encode_value(format, &resp)?))
            });
            fut
        });
        self.routes.insert(method.to_string(), erased);
        self
    }

    /// Registers a handler that works on raw body bytes.
    pub fn route_raw<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(RequestContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Bytes>> + Send + 'static,
    {
        let erased: BoxedHandler = Arc::new(move |ctx: RequestContext, body: Bytes| {
            let fut: BoxFuture<'static, RpcResult<Bytes>> = Box::pin(handler(ctx, body));
            fut
        });
        self.routes.insert(method.to_string(), erased);
        self
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.routes.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// Runs the handler registered for `ctx.header.method`.
    pub fn dispatch(&self, ctx: RequestContext, body: Bytes) -> BoxFuture<'static, RpcResult<Bytes>> {
        match self.routes.get(ctx.method()) {
            Some(handler) => handler(ctx, body),
            None => {
                let err = RpcError::system(ERROR_METHOD_NOT_FOUND, format!("method {} not found", ctx.method()));
                Box::pin(future::ready(Err(err)))
            }
        }
    }
}
