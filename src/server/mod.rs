//! HTTP Server
//!
//! One hyper http1 connection task per accepted socket, all sharing an
//! [`AppState`]. The accept loop stops when the shutdown token fires;
//! connections already in flight run to completion.

mod dto;
mod exposition;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::service::TryOnService;

pub use dto::{
    decode_image, encode_image, error_kind, BodyPreprocessRequest, ErrorResponse, GarmentPreprocessRequest,
    GenerateRequestBody, GenerateResponse, InvalidateResponse, PreprocessResponse, TextPreprocessRequest,
};
pub use exposition::MetricsExporter;
pub use routes::{handle, status_for, AppState};

/// Default request body limit (images arrive base64-encoded)
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8001".to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Bind the configured address and serve until `shutdown` fires
pub async fn serve(config: &ServerConfig, service: Arc<TryOnService>, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = config
        .addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid listen address '{}': {}", config.addr, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", addr, e)))?;

    let state = Arc::new(AppState::new(service, config.max_body_bytes)?);
    serve_listener(listener, state, shutdown).await
}

/// Serve on an already-bound listener
pub async fn serve_listener(listener: TcpListener, state: Arc<AppState>, shutdown: CancellationToken) -> Result<()> {
    let local = listener.local_addr()?;
    info!("Try-on cache server listening on {}", local);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Server on {} shutting down", local);
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            },
        };

        debug!(peer = %peer, "Connection accepted");
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(state.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(peer = %peer, "Connection error: {}", e);
            }
        });
    }
}
