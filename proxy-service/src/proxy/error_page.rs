//! Error responses for the data plane.
//!
//! Precedence: a configured error target is asked for a page with a
//! sub-request; failing that, a configured directory of static pages is
//! consulted; failing that, a minimal built-in page is emitted. This path
//! never consults the router and never recurses into itself.

use std::path::{Path, PathBuf};

use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE, HOST};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use percent_encoding::utf8_percent_encode;
use tracing::{debug, warn};
use url::Url;

use crate::body::{self, ProxyBody};
use crate::error::{ServerError, ServerResult};
use crate::proxy::engine::PATH_ENCODE_SET;
use crate::proxy::headers::copy_end_to_end;
use crate::proxy::state::UpstreamClient;

pub struct ErrorPages {
    error_target: Option<Url>,
    error_path: Option<PathBuf>,
    client: UpstreamClient,
}

impl ErrorPages {
    pub fn new(
        error_target: Option<Url>,
        error_path: Option<PathBuf>,
        client: UpstreamClient,
    ) -> Self {
        Self {
            error_target,
            error_path,
            client,
        }
    }

    /// Produce the error response for `status`, falling through the
    /// precedence chain until something renders.
    pub async fn respond(
        &self,
        status: StatusCode,
        original_path: &str,
        client_headers: &HeaderMap,
    ) -> Response<ProxyBody> {
        if let Some(target) = &self.error_target {
            match self
                .fetch_custom(target, status, original_path, client_headers)
                .await
            {
                Ok(response) => return response,
                Err(err) => warn!(%err, "custom error page request failed"),
            }
        }

        if let Some(dir) = &self.error_path {
            if let Some(response) = load_file(dir, status).await {
                return response;
            }
        }

        default_page(status)
    }

    /// GET `<error_target>/<code>?url=<original path>` and relay the
    /// sub-response to the client.
    async fn fetch_custom(
        &self,
        target: &Url,
        status: StatusCode,
        original_path: &str,
        client_headers: &HeaderMap,
    ) -> ServerResult<Response<ProxyBody>> {
        let mut url = target.clone();
        url.set_path(&format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            status.as_u16()
        ));
        url.set_query(Some(&format!(
            "url={}",
            utf8_percent_encode(original_path, PATH_ENCODE_SET)
        )));
        debug!(%url, "requesting custom error page");

        let mut builder = Request::builder().method(Method::GET).uri(url.as_str());
        if let Some(headers) = builder.headers_mut() {
            copy_end_to_end(client_headers, headers);
            // The sub-request is a bodiless GET regardless of the original.
            headers.remove(http::header::CONTENT_LENGTH);
            headers.remove(http::header::CONTENT_TYPE);
            headers.remove(HOST);
            if let Some(authority) = url
                .host_str()
                .map(|host| authority_string(host, url.port()))
            {
                if let Ok(value) = HeaderValue::from_str(&authority) {
                    headers.insert(HOST, value);
                }
            }
        }
        let request = builder.body(body::empty())?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| ServerError::UpstreamUnreachable(err.to_string()))?;

        let (parts, sub_body) = response.into_parts();
        let mut out = Response::builder().status(parts.status);
        if let Some(headers) = out.headers_mut() {
            copy_end_to_end(&parts.headers, headers);
        }
        Ok(out.body(
            sub_body
                .map_err(|err| ServerError::UpstreamAborted(err.to_string()))
                .boxed_unsync(),
        )?)
    }
}

fn authority_string(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Look up `<error_path>/<code>.html`, then `<error_path>/error.html`.
async fn load_file(dir: &Path, status: StatusCode) -> Option<Response<ProxyBody>> {
    for name in [format!("{}.html", status.as_u16()), "error.html".to_string()] {
        let path = dir.join(&name);
        match tokio::fs::read(&path).await {
            Ok(content) => {
                return Some(html_response(status, content.into()));
            }
            Err(err) => debug!(path = %path.display(), %err, "no error file"),
        }
    }
    None
}

/// Minimal built-in page: the numeric status and its reason phrase.
fn default_page(status: StatusCode) -> Response<ProxyBody> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let page = format!(
        "<!DOCTYPE html>\n<html><head><title>{code} {reason}</title></head>\n\
         <body><h1>{code} {reason}</h1></body></html>\n",
        code = status.as_u16(),
    );
    html_response(status, page.into())
}

fn html_response(status: StatusCode, content: bytes::Bytes) -> Response<ProxyBody> {
    let mut response = Response::new(body::full(content));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}
