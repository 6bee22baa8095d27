//! The data plane: resolve a route, rewrite the path, forward, stream.
//!
//! Each request moves through resolve → connect → stream; failures at any
//! stage divert to the error handler, which owns the response from there.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http::header::{
    HeaderValue, CONNECTION, CONTENT_TYPE, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::upgrade;
use hyper_util::rt::TokioIo;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};
use url::Url;

use routetable::RouteMatch;

use crate::body::{self, IdleTimeoutBody, ProxyBody};
use crate::error::{ServerError, ServerResult};
use crate::proxy::headers::{
    apply_custom_headers, apply_x_forwarded, copy_end_to_end, ForwardedContext,
};
use crate::proxy::routes::RouteTable;
use crate::proxy::state::ProxyState;
use crate::proxy::HEALTH_CHECK_PATH;

/// Re-encoding applied after the edge's single decode pass: everything but
/// unreserved characters and `/` is escaped.
pub(crate) const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Entry point for every data-plane request.
pub async fn handle(
    state: &Arc<ProxyState>,
    req: Request<Incoming>,
    remote: SocketAddr,
) -> ServerResult<Response<ProxyBody>> {
    if req.uri().path() == HEALTH_CHECK_PATH {
        return health_check();
    }
    if is_websocket_upgrade(&req) {
        return proxy_websocket(state, req, remote).await;
    }
    proxy_web(state, req, remote).await
}

fn health_check() -> ServerResult<Response<ProxyBody>> {
    let mut response = Response::new(body::full(r#"{"status": "OK"}"#));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

struct ResolvedTarget {
    prefix: String,
    url: Url,
}

/// Decode the request path once, find the longest matching prefix, and build
/// the upstream URL for it.
async fn resolve(
    state: &ProxyState,
    raw_path: &str,
    query: Option<&str>,
) -> ServerResult<Option<ResolvedTarget>> {
    let decoded = percent_decode_str(raw_path).decode_utf8_lossy();
    let Some(RouteMatch { prefix, record }) = state.routes().target_for_path(&decoded).await?
    else {
        return Ok(None);
    };
    let config = state.config();
    let url = rewrite_target_url(
        config.prepend_path,
        config.include_prefix,
        &prefix,
        &record.target,
        &decoded,
        query,
    )?;
    Ok(Some(ResolvedTarget { prefix, url }))
}

/// Upstream URL construction. `decoded_path` is the request path after the
/// edge's single decode pass; the query is forwarded unchanged.
pub fn rewrite_target_url(
    prepend_path: bool,
    include_prefix: bool,
    prefix: &str,
    target: &str,
    decoded_path: &str,
    query: Option<&str>,
) -> ServerResult<Url> {
    let mut proxy_path = utf8_percent_encode(decoded_path, PATH_ENCODE_SET).to_string();
    if !include_prefix && prefix != "/" {
        let encoded_prefix = utf8_percent_encode(prefix, PATH_ENCODE_SET).to_string();
        if let Some(rest) = proxy_path.strip_prefix(&encoded_prefix) {
            proxy_path = rest.to_string();
        }
    }

    let mut url = Url::parse(target)
        .map_err(|err| ServerError::Config(format!("invalid target {target}: {err}")))?;
    let request_query = query.filter(|q| !q.is_empty());

    if prepend_path {
        let target_query = url
            .query()
            .filter(|q| !q.is_empty())
            .map(str::to_string);
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            proxy_path.trim_start_matches('/')
        );
        url.set_path(&joined);
        let merged = match (target_query, request_query) {
            (Some(a), Some(b)) => Some(format!("{a}&{b}")),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b.to_string()),
            (None, None) => None,
        };
        url.set_query(merged.as_deref());
    } else {
        if proxy_path.is_empty() {
            proxy_path.push('/');
        }
        url.set_path(&proxy_path);
        url.set_query(request_query);
    }
    Ok(url)
}

async fn proxy_web(
    state: &Arc<ProxyState>,
    req: Request<Incoming>,
    remote: SocketAddr,
) -> ServerResult<Response<ProxyBody>> {
    let raw_path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let resolved = match resolve(state, &raw_path, query.as_deref()).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(path = %raw_path, %err, "route lookup failed");
            return Ok(state
                .error_pages()
                .respond(err.status(), &raw_path, req.headers())
                .await);
        }
    };
    let Some(target) = resolved else {
        warn!(path = %raw_path, "no route matched");
        return Ok(state
            .error_pages()
            .respond(StatusCode::NOT_FOUND, &raw_path, req.headers())
            .await);
    };

    debug!(path = %raw_path, prefix = %target.prefix, url = %target.url, "proxying request");

    let config = state.config();
    let (parts, client_body) = req.into_parts();
    let client_body: ProxyBody = client_body.map_err(ServerError::Hyper).boxed_unsync();
    let client_body = if config.proxy_timeout > Duration::ZERO {
        IdleTimeoutBody::new(client_body, config.proxy_timeout).boxed_unsync()
    } else {
        client_body
    };
    let upstream_req =
        build_upstream_request(state, &parts, &target.url, remote, "http", client_body)?;

    let response_fut = state.client().request(upstream_req);
    let result = if config.timeout > Duration::ZERO {
        match tokio::time::timeout(config.timeout, response_fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(prefix = %target.prefix, url = %target.url, "upstream timed out");
                return Ok(state
                    .error_pages()
                    .respond(StatusCode::GATEWAY_TIMEOUT, &raw_path, &parts.headers)
                    .await);
            }
        }
    } else {
        response_fut.await
    };

    let upstream_response = match result {
        Ok(response) => response,
        Err(err) => {
            warn!(prefix = %target.prefix, url = %target.url, %err, "upstream dispatch failed");
            return Ok(state
                .error_pages()
                .respond(StatusCode::SERVICE_UNAVAILABLE, &raw_path, &parts.headers)
                .await);
        }
    };

    // A flood of 404s or 503s from a dying upstream should not make the
    // route look active.
    if upstream_response.status().as_u16() < 300 {
        state.routes().touch(&target.prefix);
    } else {
        debug!(status = %upstream_response.status(), prefix = %target.prefix,
            "not recording activity");
    }

    let (resp_parts, resp_body) = upstream_response.into_parts();
    let mut builder = Response::builder().status(resp_parts.status);
    if let Some(headers) = builder.headers_mut() {
        copy_end_to_end(&resp_parts.headers, headers);
    }
    let resp_body: ProxyBody = resp_body
        .map_err(|err| ServerError::UpstreamAborted(err.to_string()))
        .boxed_unsync();
    let resp_body = if config.proxy_timeout > Duration::ZERO {
        IdleTimeoutBody::new(resp_body, config.proxy_timeout).boxed_unsync()
    } else {
        resp_body
    };
    Ok(builder.body(resp_body)?)
}

fn build_upstream_request(
    state: &ProxyState,
    parts: &http::request::Parts,
    url: &Url,
    remote: SocketAddr,
    proto: &'static str,
    request_body: ProxyBody,
) -> ServerResult<Request<ProxyBody>> {
    let config = state.config();

    // ws targets ride the plain HTTP connector.
    let mut http_url = url.clone();
    match http_url.scheme() {
        "ws" => {
            let _ = http_url.set_scheme("http");
        }
        "wss" => {
            let _ = http_url.set_scheme("https");
        }
        _ => {}
    }
    let uri: Uri = http_url
        .as_str()
        .parse()
        .map_err(|err| ServerError::Config(format!("invalid upstream uri: {err}")))?;

    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .version(Version::HTTP_11);
    if let Some(headers) = builder.headers_mut() {
        copy_end_to_end(&parts.headers, headers);

        let authority = authority_of(&http_url);
        if let Ok(value) = HeaderValue::from_str(&authority) {
            if config.change_origin {
                headers.insert(HOST, value);
            } else if !headers.contains_key(HOST) {
                headers.insert(HOST, value);
            }
        }

        if config.x_forward {
            apply_x_forwarded(
                headers,
                &ForwardedContext {
                    client_ip: remote.ip(),
                    proto,
                    edge_port: config.port,
                },
            );
        }
        apply_custom_headers(headers, &config.custom_headers);
    }
    Ok(builder.body(request_body)?)
}

fn authority_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or("localhost");
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

pub(crate) fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.method() == Method::GET
        && header_has_token(req.headers(), CONNECTION, "upgrade")
        && header_has_token(req.headers(), UPGRADE, "websocket")
        && req.headers().contains_key(SEC_WEBSOCKET_KEY)
}

fn header_has_token(
    headers: &http::HeaderMap,
    name: http::header::HeaderName,
    token: &str,
) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
}

/// Relay a WebSocket upgrade: dial the upstream first so a refused
/// connection surfaces as an HTTP error, then complete the client handshake
/// and pipe frames in both directions until either side closes.
async fn proxy_websocket(
    state: &Arc<ProxyState>,
    req: Request<Incoming>,
    remote: SocketAddr,
) -> ServerResult<Response<ProxyBody>> {
    let raw_path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let resolved = match resolve(state, &raw_path, query.as_deref()).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(path = %raw_path, %err, "route lookup failed");
            return Ok(state
                .error_pages()
                .respond(err.status(), &raw_path, req.headers())
                .await);
        }
    };
    let Some(target) = resolved else {
        warn!(path = %raw_path, "no route matched websocket request");
        return Ok(state
            .error_pages()
            .respond(StatusCode::NOT_FOUND, &raw_path, req.headers())
            .await);
    };

    let mut ws_url = target.url.clone();
    match ws_url.scheme() {
        "http" => {
            let _ = ws_url.set_scheme("ws");
        }
        "https" => {
            let _ = ws_url.set_scheme("wss");
        }
        _ => {}
    }
    debug!(path = %raw_path, url = %ws_url, "proxying websocket");

    let key = match req.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) => key.clone(),
        None => {
            return Ok(state
                .error_pages()
                .respond(StatusCode::BAD_REQUEST, &raw_path, req.headers())
                .await)
        }
    };

    // The upstream handshake gets the client's end-to-end headers, but the
    // handshake fields themselves are regenerated for this hop.
    let mut builder = Request::builder().method(Method::GET).uri(ws_url.as_str());
    if let Some(headers) = builder.headers_mut() {
        copy_end_to_end(req.headers(), headers);
        headers.remove(HOST);
        headers.remove(http::header::CONTENT_LENGTH);
        headers.remove(SEC_WEBSOCKET_KEY);
        headers.remove(SEC_WEBSOCKET_VERSION);
        headers.remove(SEC_WEBSOCKET_EXTENSIONS);
        let config = state.config();
        if config.x_forward {
            apply_x_forwarded(
                headers,
                &ForwardedContext {
                    client_ip: remote.ip(),
                    proto: "ws",
                    edge_port: config.port,
                },
            );
        }
        apply_custom_headers(headers, &config.custom_headers);
    }
    let upstream_request = builder.body(())?;

    let config = state.config();
    let connect = tokio_tungstenite::connect_async(upstream_request);
    let connect_result = if config.timeout > Duration::ZERO {
        match tokio::time::timeout(config.timeout, connect).await {
            Ok(result) => result,
            Err(_) => {
                warn!(url = %ws_url, "websocket upstream timed out");
                return Ok(state
                    .error_pages()
                    .respond(StatusCode::GATEWAY_TIMEOUT, &raw_path, req.headers())
                    .await);
            }
        }
    } else {
        connect.await
    };

    let (upstream_ws, upstream_response) = match connect_result {
        Ok(pair) => pair,
        Err(err) => {
            warn!(url = %ws_url, %err, "websocket upstream connect failed");
            return Ok(state
                .error_pages()
                .respond(StatusCode::SERVICE_UNAVAILABLE, &raw_path, req.headers())
                .await);
        }
    };

    let accept = derive_accept_key(key.as_bytes());
    let protocol = upstream_response.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();
    let routes = state.routes().clone();
    let prefix = target.prefix.clone();

    let upgrade_fut = upgrade::on(req);
    tokio::spawn(async move {
        match upgrade_fut.await {
            Ok(upgraded) => {
                let client_ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                relay(routes, prefix, client_ws, upstream_ws).await;
            }
            Err(err) => error!(%err, "websocket upgrade failed"),
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, HeaderValue::from_static("websocket"))
        .header(CONNECTION, HeaderValue::from_static("Upgrade"))
        .header(SEC_WEBSOCKET_ACCEPT, accept.as_str());
    if let Some(protocol) = protocol {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    Ok(builder.body(body::empty())?)
}

async fn relay(
    routes: RouteTable,
    prefix: String,
    client_ws: WebSocketStream<TokioIo<upgrade::Upgraded>>,
    upstream_ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
) {
    let (mut client_sink, mut client_stream) = client_ws.split();
    let (mut upstream_sink, mut upstream_stream) = upstream_ws.split();

    loop {
        tokio::select! {
            msg = client_stream.next() => match msg {
                Some(Ok(msg)) => {
                    routes.touch(&prefix);
                    let closing = matches!(msg, Message::Close(_));
                    if upstream_sink.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                Some(Err(err)) => {
                    debug!(%prefix, %err, "client websocket error");
                    break;
                }
                None => break,
            },
            msg = upstream_stream.next() => match msg {
                Some(Ok(msg)) => {
                    routes.touch(&prefix);
                    let closing = matches!(msg, Message::Close(_));
                    if client_sink.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                Some(Err(err)) => {
                    debug!(%prefix, %err, "upstream websocket error");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = client_sink.close().await;
    let _ = upstream_sink.close().await;
    debug!(%prefix, "websocket relay finished");
}
