#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use portpicker::pick_unused_port;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use proxy_service::{ProxyConfig, ProxyService, ServerHandle};
use routetable::MemoryStore;

pub const AUTH_TOKEN: &str = "integration-secret";

pub struct Backend {
    pub port: u16,
    pub task: JoinHandle<()>,
}

impl Backend {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// HTTP/1.1 backend that echoes the request line and headers back as JSON,
/// with a pair of `Set-Cookie` headers to exercise multi-value passthrough.
pub async fn start_echo_backend(name: &'static str) -> Backend {
    start_echo_backend_with_delay(name, Duration::ZERO).await
}

pub async fn start_echo_backend_with_delay(name: &'static str, delay: Duration) -> Backend {
    let port = pick_unused_port().expect("pick backend port");
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);
    let listener = TcpListener::bind(addr).await.expect("bind backend");

    let task = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    eprintln!("backend accept error: {err}");
                    break;
                }
            };
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    if delay > Duration::ZERO {
                        tokio::time::sleep(delay).await;
                    }

                    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
                    for (key, value) in req.headers() {
                        headers
                            .entry(key.as_str().to_string())
                            .or_default()
                            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
                    }
                    let echo = serde_json::json!({
                        "backend": name,
                        "method": req.method().as_str(),
                        "uri": req.uri().to_string(),
                        "headers": headers,
                    });

                    Ok::<_, hyper::Error>(
                        Response::builder()
                            .status(StatusCode::OK)
                            .header("content-type", "application/json")
                            .header("set-cookie", "cookie-a=1")
                            .header("set-cookie", "cookie-b=2")
                            .body(Full::new(Bytes::from(echo.to_string())))
                            .expect("build echo response"),
                    )
                });
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    eprintln!("backend serve error: {err}");
                }
            });
        }
    });

    Backend { port, task }
}

/// Error-page origin: GET `/<code>?url=...` answers with that status and a
/// body naming the request it saw.
pub async fn start_error_backend() -> Backend {
    let port = pick_unused_port().expect("pick error backend port");
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);
    let listener = TcpListener::bind(addr).await.expect("bind error backend");

    let task = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    eprintln!("error backend accept error: {err}");
                    break;
                }
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let status = req
                        .uri()
                        .path()
                        .trim_start_matches('/')
                        .parse::<u16>()
                        .ok()
                        .and_then(|code| StatusCode::from_u16(code).ok())
                        .unwrap_or(StatusCode::OK);
                    let page = format!("custom page {}", req.uri());

                    Ok::<_, hyper::Error>(
                        Response::builder()
                            .status(status)
                            .header("content-type", "text/html")
                            .body(Full::new(Bytes::from(page)))
                            .expect("build error response"),
                    )
                });
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    eprintln!("error backend serve error: {err}");
                }
            });
        }
    });

    Backend { port, task }
}

pub struct Proxy {
    pub port: u16,
    pub api_port: u16,
    pub store: Arc<MemoryStore>,
    pub handle: ServerHandle,
}

impl Proxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.api_port)
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let _ = self.handle.shutdown_tx.send(());
    }
}

pub async fn start_proxy(mutate: impl FnOnce(&mut ProxyConfig)) -> Proxy {
    let port = pick_unused_port().expect("pick proxy port");
    let mut api_port = pick_unused_port().expect("pick api port");
    while api_port == port {
        api_port = pick_unused_port().expect("pick api port");
    }

    let mut config = ProxyConfig {
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port,
        api_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        api_port,
        auth_token: Some(AUTH_TOKEN.to_string()),
        ..ProxyConfig::default()
    };
    mutate(&mut config);

    let store = Arc::new(MemoryStore::new());
    let service = ProxyService::new(config, Arc::clone(&store) as _);
    let handle = service.start().await.expect("start proxy");

    wait_for_port(port).await;
    wait_for_port(api_port).await;

    Proxy {
        port,
        api_port,
        store,
        handle,
    }
}

pub async fn wait_for_port(port: u16) {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if tokio::net::TcpStream::connect((IpAddr::V4(Ipv4Addr::LOCALHOST), port))
            .await
            .is_ok()
        {
            break;
        }
        if std::time::Instant::now() > deadline {
            panic!("server did not start listening on port {port}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .http1_only()
        .build()
        .expect("build client")
}

/// Install a route through the management API.
pub async fn add_route(proxy: &Proxy, prefix: &str, target: &str) {
    let encoded: String = percent_encode_prefix(prefix);
    let response = client()
        .put(proxy.api_url(&format!("/api/routes/{encoded}")))
        .header("authorization", format!("token {AUTH_TOKEN}"))
        .json(&serde_json::json!({ "target": target }))
        .send()
        .await
        .expect("add route");
    assert_eq!(response.status(), StatusCode::CREATED, "route add failed");
}

fn percent_encode_prefix(prefix: &str) -> String {
    prefix.replace('/', "%2F")
}
