use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, built once at startup and passed by reference into
/// the route table, data plane, and management API. The only process-wide
/// mutable state is the route store itself.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Public-facing bind address of the proxy.
    pub ip: IpAddr,
    pub port: u16,
    /// Inward-facing bind address of the management API.
    pub api_ip: IpAddr,
    pub api_port: u16,

    /// Target installed at `/` on startup, if any.
    pub default_target: Option<String>,
    /// Origin consulted for custom error pages.
    pub error_target: Option<url::Url>,
    /// Directory of static `<code>.html` error pages.
    pub error_path: Option<PathBuf>,

    /// Prepend the target's own path to the rewritten request path.
    pub prepend_path: bool,
    /// Keep the matched prefix in the rewritten request path.
    pub include_prefix: bool,
    /// Add `X-Forwarded-*` headers to proxied requests.
    pub x_forward: bool,
    /// Rewrite `Host` to the upstream authority. Accepted as a hook; the
    /// default keeps the client's `Host`.
    pub change_origin: bool,
    /// Headers applied to every proxied request, last, overriding any
    /// earlier value.
    pub custom_headers: Vec<(String, String)>,

    /// Limit from accepting a request to the first upstream response byte.
    /// Zero means no limit.
    pub timeout: Duration,
    /// Idle limit on either direction once streaming has begun. Zero means
    /// no limit.
    pub proxy_timeout: Duration,

    /// Bearer token for the management API. `None` disables the check,
    /// which only happens when embedding the service directly; the binary
    /// always configures one.
    pub auth_token: Option<String>,
    /// Storage backend identifier resolved through the registry.
    pub storage_backend: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            api_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            api_port: 8001,
            default_target: None,
            error_target: None,
            error_path: None,
            prepend_path: true,
            include_prefix: true,
            x_forward: true,
            change_origin: false,
            custom_headers: Vec::new(),
            timeout: Duration::ZERO,
            proxy_timeout: Duration::ZERO,
            auth_token: None,
            storage_backend: "memory".to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn api_addr(&self) -> SocketAddr {
        SocketAddr::new(self.api_ip, self.api_port)
    }
}

/// Name of the environment variable holding the management API token.
pub const AUTH_TOKEN_ENV: &str = "CONFIGPROXY_AUTH_TOKEN";

pub fn auth_token_from_env() -> Option<String> {
    std::env::var(AUTH_TOKEN_ENV).ok().filter(|t| !t.is_empty())
}
