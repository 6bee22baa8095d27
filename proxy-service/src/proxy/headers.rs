//! Header rewriting rules for proxied requests and responses.

use std::net::IpAddr;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

/// Hop-by-hop headers are meaningful for a single transport hop only and are
/// stripped in both directions. `Upgrade` is handled separately during a
/// WebSocket handshake.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}

/// Copy end-to-end headers, preserving multi-valued entries as distinct
/// occurrences in their original order.
pub fn copy_end_to_end(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src {
        if is_hop_by_hop(name) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

/// What the edge observed about the client, for `X-Forwarded-*`.
#[derive(Debug, Clone)]
pub struct ForwardedContext {
    pub client_ip: IpAddr,
    pub proto: &'static str,
    pub edge_port: u16,
}

/// Append this hop to the `X-Forwarded-For`/`-Port`/`-Proto` chains and set
/// `X-Forwarded-Host` if no earlier proxy did.
pub fn apply_x_forwarded(headers: &mut HeaderMap, ctx: &ForwardedContext) {
    let host = headers
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let port = host
        .as_deref()
        .and_then(|host| host.rsplit_once(':'))
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .unwrap_or(ctx.edge_port);

    append_chain(headers, "x-forwarded-for", &ctx.client_ip.to_string());
    append_chain(headers, "x-forwarded-port", &port.to_string());
    append_chain(headers, "x-forwarded-proto", ctx.proto);

    if !headers.contains_key("x-forwarded-host") {
        if let Some(host) = host {
            if let Ok(value) = HeaderValue::from_str(&host) {
                headers.insert(HeaderName::from_static("x-forwarded-host"), value);
            }
        }
    }
}

fn append_chain(headers: &mut HeaderMap, name: &'static str, hop: &str) {
    let name = HeaderName::from_static(name);
    let chained = match headers.get(&name).and_then(|value| value.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing},{hop}"),
        _ => hop.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&chained) {
        headers.insert(name, value);
    }
}

/// Configured custom headers are applied last and win any collision.
pub fn apply_custom_headers(headers: &mut HeaderMap, custom: &[(String, String)]) {
    for (name, value) in custom {
        match (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value.trim()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid custom header"),
        }
    }
}
