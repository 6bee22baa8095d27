//! Listen surfaces: the public data plane and the management API.
//!
//! Each inbound connection is served on its own task; the data plane keeps
//! HTTP/1.1 upgrades enabled for WebSocket relaying. Both loops stop when
//! the shutdown channel fires.

use std::net::SocketAddr;
use std::sync::Arc;

use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use routetable::RouteStore;

use crate::config::ProxyConfig;
use crate::error::{ServerError, ServerResult};
use crate::proxy::{api, engine, state::ProxyState};
use crate::storage::StoreRegistry;

/// Handle for controlling a running proxy.
pub struct ServerHandle {
    pub shutdown_tx: watch::Sender<()>,
    pub ready_rx: oneshot::Receiver<()>,
    pub finished_rx: oneshot::Receiver<()>,
}

pub struct ProxyService {
    state: Arc<ProxyState>,
}

impl ProxyService {
    pub fn new(config: ProxyConfig, store: Arc<dyn RouteStore>) -> Self {
        Self {
            state: Arc::new(ProxyState::new(config, store)),
        }
    }

    /// Build the store named by `config.storage_backend` from the built-in
    /// registry.
    pub fn from_config(config: ProxyConfig) -> ServerResult<Self> {
        let store = StoreRegistry::builtin().build(&config.storage_backend)?;
        Ok(Self::new(config, store))
    }

    pub fn state(&self) -> Arc<ProxyState> {
        Arc::clone(&self.state)
    }

    /// Bind both ports and start serving. Binding happens before this
    /// returns, so a bind failure surfaces as an error rather than a dead
    /// task.
    pub async fn start(&self) -> ServerResult<ServerHandle> {
        let config = self.state.config().clone();

        if let Some(default_target) = &config.default_target {
            self.state
                .routes()
                .add_route("/", default_target.clone(), serde_json::Map::new())
                .await?;
        }

        let proxy_listener = bind_tcp_listener(config.listen_addr())?;
        let api_listener = bind_tcp_listener(config.api_addr())?;
        info!(address = %config.listen_addr(), "proxying requests");
        info!(address = %config.api_addr(), "serving api at /api/routes");

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let (ready_tx, ready_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();

        let data_plane = tokio::spawn(run_data_plane(
            proxy_listener,
            Arc::clone(&self.state),
            shutdown_rx.clone(),
        ));
        let api_plane = tokio::spawn(run_api(
            api_listener,
            Arc::clone(&self.state),
            shutdown_rx,
        ));

        tokio::spawn(async move {
            let _ = data_plane.await;
            let _ = api_plane.await;
            let _ = finished_tx.send(());
        });

        let _ = ready_tx.send(());

        Ok(ServerHandle {
            shutdown_tx,
            ready_rx,
            finished_rx,
        })
    }
}

fn bind_tcp_listener(addr: SocketAddr) -> ServerResult<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(ServerError::Io)?;
    let _ = socket.set_reuseaddr(true);
    socket.bind(addr).map_err(ServerError::Io)?;
    socket.listen(1024).map_err(ServerError::Io)
}

async fn run_data_plane(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("data plane shutting down");
                break;
            }
            accept_res = listener.accept() => {
                match accept_res {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let service = service_fn(move |req: http::Request<Incoming>| {
                                let state = Arc::clone(&state);
                                async move { engine::handle(&state, req, peer).await }
                            });
                            let conn = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .with_upgrades();
                            if let Err(err) = conn.await {
                                debug!(%peer, %err, "data plane connection ended with error");
                            }
                        });
                    }
                    Err(err) => error!(%err, "accept failed"),
                }
            }
        }
    }
}

async fn run_api(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("api shutting down");
                break;
            }
            accept_res = listener.accept() => {
                match accept_res {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let service = service_fn(move |req: http::Request<Incoming>| {
                                let state = Arc::clone(&state);
                                async move { handle_api_request(&state, req).await }
                            });
                            if let Err(err) = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                            {
                                debug!(%peer, %err, "api connection ended with error");
                            }
                        });
                    }
                    Err(err) => error!(%err, "api accept failed"),
                }
            }
        }
    }
}

/// Never hands hyper an `Err`: a failure at any stage still produces an HTTP
/// response, so the connection survives and the caller sees a status code.
async fn handle_api_request(
    state: &ProxyState,
    req: http::Request<Incoming>,
) -> ServerResult<http::Response<crate::body::ProxyBody>> {
    let (parts, request_body) = req.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();

    let response = match request_body.collect().await {
        Ok(collected) => {
            let req = http::Request::from_parts(parts, ());
            match api::handle_api(state, req, collected.to_bytes()).await {
                Ok(response) => response,
                Err(err) => {
                    error!(%err, %method, %path, "api handler failed");
                    api::error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error".to_string(),
                    )
                }
            }
        }
        Err(err) => {
            warn!(%err, %method, %path, "failed to read api request body");
            api::error_response(
                StatusCode::BAD_REQUEST,
                "failed to read request body".to_string(),
            )
        }
    };

    let status = response.status();
    if status.is_client_error() {
        warn!(%status, %method, %path, "api request");
    } else if status.is_server_error() {
        error!(%status, %method, %path, "api request");
    } else {
        info!(%status, %method, %path, "api request");
    }
    Ok(response)
}
