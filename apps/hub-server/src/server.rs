//! WebSocket front end.
//!
//! Listens on TCP, upgrades requests on the configured path and hands each
//! socket to the [`Hub`] under the user id found in the trusted header.
//! Authentication itself happens upstream; a request without the header is
//! refused with 401.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use flippy_hub::{Hub, HubError};

/// Errors from the front end.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),

    #[error("request carried no user id")]
    MissingUserId,

    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Front end settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Upgrade path, e.g. `/ws`.
    pub path: String,
    /// Header holding the authenticated user id.
    pub user_header: String,
}

pub struct HubServer {
    config: ServerConfig,
    hub: Hub,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HubServer {
    pub fn new(config: ServerConfig, hub: Hub) -> Arc<Self> {
        Arc::new(Self {
            config,
            hub,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the bound address once [`run`](Self::run) is listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Stops accepting and shuts the hub down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Accepts connections until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.listen).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!(path = %self.config.path, "hub server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    self.hub.shutdown().await;
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection refused: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let max_size = self.hub.config().max_message_size;
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(max_size);
        ws_config.max_frame_size = Some(max_size);

        let path = self.config.path.as_str();
        let header = self.config.user_header.as_str();
        let mut user_id: Option<String> = None;

        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() != path {
                return Err(reject(StatusCode::NOT_FOUND, "unknown path"));
            }
            match trusted_user_id(req, header) {
                Some(id) => {
                    user_id = Some(id);
                    Ok(resp)
                }
                None => Err(reject(StatusCode::UNAUTHORIZED, "missing user id")),
            }
        };

        let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
        let user_id = user_id.ok_or(ServerError::MissingUserId)?;

        let conn_id = self.hub.register(ws, user_id.as_str()).await?;
        tracing::debug!(%peer_addr, %conn_id, %user_id, "WebSocket connection established");
        Ok(())
    }
}

fn trusted_user_id(req: &Request, header: &str) -> Option<String> {
    req.headers()
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_owned()));
    *resp.status_mut() = status;
    resp
}
