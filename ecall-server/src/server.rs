//! # TCP Server
//!
//! Accept framed connections and answer each request through the service
//! pipeline, replying on the same connection with the request's header
//! (`seq` included) and format.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use ecall_common::config::{ConnectionConfig, FrameLimits};
use ecall_common::connection::{Connection, Dispatcher, FrameHandler, Overflow};
use ecall_common::error::{RpcError, ERROR_INTERNAL, ERROR_SERVICE_NOT_FOUND};
use ecall_common::protocol::{decode, encode_raw, encode_value, BodyMap};
use ecall_common::types::{Format, Header};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::middleware::Pipeline;
use crate::router::RequestContext;

/// Configuration for one served service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, e.g. "0.0.0.0:8001".
    pub listen: String,
    /// Service name answered by this server.
    pub service: String,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: "0.0.0.0:8001".to_string(),
            service: "echo".to_string(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Answers request frames arriving on any accepted connection.
struct ServiceHandler {
    pipeline: Arc<Pipeline>,
    limits: FrameLimits,
}

impl FrameHandler for ServiceHandler {
    fn handle<'a>(&'a self, frame: Bytes, conn: Arc<Connection>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let (format, header, body) = match decode(frame, &self.limits) {
                Ok(packet) => packet.into_parts(),
                Err(err) => {
                    warn!(peer = %conn.peer(), error = %err, "dropping undecodable request");
                    return;
                }
            };
            let seq = header.seq;
            let outcome = if header.service != self.pipeline.router().service() {
                debug!(peer = %conn.peer(), seq, service = %header.service, "request for another service");
                Err(RpcError::system(
                    ERROR_SERVICE_NOT_FOUND,
                    format!("service {} not found", header.service),
                ))
            } else {
                let ctx = RequestContext::new(header.clone(), format, conn.peer());
                match AssertUnwindSafe(self.pipeline.call(ctx, body)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!(peer = %conn.peer(), seq, method = %header.method, "request handler panicked");
                        Err(RpcError::system(ERROR_INTERNAL, "handler panicked"))
                    }
                }
            };

            let Some(frame) = response_frame(format, header, outcome) else {
                return;
            };
            if conn.send(frame).await.is_err() {
                debug!(peer = %conn.peer(), seq, "connection closed before response");
            }
        })
    }
}

/// Frames the response: the request header plus `ret`/`msg`, and either the
/// handler's body or an empty map.
fn response_frame(format: Format, header: Header, outcome: Result<Bytes, RpcError>) -> Option<Bytes> {
    let (header, body) = match outcome {
        Ok(body) => (header.with_result(0, ""), body),
        Err(err) => {
            let empty = match encode_value(format, &BodyMap::new()) {
                Ok(bytes) => Bytes::from(bytes),
                Err(encode_err) => {
                    error!(error = %encode_err, "encode empty response body");
                    return None;
                }
            };
            (header.with_result(err.code(), err.message()), empty)
        }
    };
    match encode_raw(format, &header, &body) {
        Ok(frame) => Some(frame),
        Err(err) => {
            error!(seq = header.seq, method = %header.method, error = %err, "encode response");
            None
        }
    }
}

/// Listening server for one service pipeline.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    dispatcher: Dispatcher,
}

impl Server {
    /// Binds `config.listen` and prepares the dispatcher.
    ///
    /// Requests arriving while every worker is busy are dropped; their
    /// callers see a timeout.
    pub async fn bind(config: ServerConfig, pipeline: impl Into<Pipeline>) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.listen).await?;
        let handler = ServiceHandler {
            pipeline: Arc::new(pipeline.into()),
            limits: config.connection.limits,
        };
        let dispatcher =
            Dispatcher::with_overflow(Arc::new(handler), config.connection.dispatch_workers, Overflow::Drop);
        info!(addr = %listener.local_addr()?, service = %config.service, "server listening");
        Ok(Server {
            listener,
            config,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts connections until the task is dropped.
    pub async fn serve(self) -> io::Result<()> {
        self.serve_with_shutdown(futures::future::pending()).await
    }

    /// Accepts connections until `shutdown` completes.
    ///
    /// Accept errors are logged and the loop keeps going; established
    /// connections are not closed by shutdown.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = &mut shutdown => {
                    info!(service = %self.config.service, "server shutting down");
                    return Ok(());
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    match Connection::from_stream(stream, &self.config.connection, self.dispatcher.clone()) {
                        Ok(conn) => debug!(id = conn.id(), %peer, "accepted connection"),
                        Err(err) => warn!(%peer, error = %err, "failed to set up connection"),
                    }
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    }
}
