//! Management API: `/api/routes` CRUD over the routing table.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};
use url::form_urlencoded;

use crate::body::{self, ProxyBody};
use crate::error::{ServerError, ServerResult};
use crate::proxy::state::ProxyState;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub async fn handle_api(
    state: &ProxyState,
    req: Request<()>,
    request_body: Bytes,
) -> ServerResult<Response<ProxyBody>> {
    if !authorized(state.config().auth_token.as_deref(), req.headers()) {
        debug!(path = %req.uri().path(), "rejecting unauthorized api request");
        return json_error(StatusCode::FORBIDDEN, "Forbidden".to_string());
    }

    let path = req.uri().path();
    let Some(rest) = path.strip_prefix("/api/routes") else {
        return json_error(StatusCode::NOT_FOUND, "unknown api endpoint".to_string());
    };
    if !rest.is_empty() && !rest.starts_with('/') {
        return json_error(StatusCode::NOT_FOUND, "unknown api endpoint".to_string());
    }

    match *req.method() {
        Method::GET if rest.is_empty() || rest == "/" => {
            let inactive_since = match inactive_since_param(req.uri().query()) {
                Ok(value) => value,
                Err(raw) => {
                    return json_error(
                        StatusCode::BAD_REQUEST,
                        format!("invalid datestamp {raw:?}, must be ISO8601"),
                    )
                }
            };
            match state.routes().get_routes(inactive_since).await {
                Ok(routes) => json_response(&routes, StatusCode::OK),
                Err(err) => storage_error(err),
            }
        }
        Method::GET => match state.routes().get_route(rest).await {
            Ok(Some(record)) => json_response(&record, StatusCode::OK),
            Ok(None) => json_error(StatusCode::NOT_FOUND, "route not found".to_string()),
            Err(err) => storage_error(err),
        },
        Method::POST | Method::PUT => {
            let payload: Value = match serde_json::from_slice(&request_body) {
                Ok(value) => value,
                Err(err) => {
                    return json_error(StatusCode::BAD_REQUEST, format!("invalid json: {err}"))
                }
            };
            let Some(mut fields) = payload.as_object().cloned() else {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "body must be a json object".to_string(),
                );
            };
            let Some(Value::String(target)) = fields.remove("target") else {
                warn!(path = %rest, "rejecting route body without string target");
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "must specify 'target' as string".to_string(),
                );
            };
            fields.remove("last_activity");

            match state.routes().add_route(rest, target, fields).await {
                Ok(()) => Ok(status_only(StatusCode::CREATED)),
                Err(err) => storage_error(err),
            }
        }
        Method::DELETE => match state.routes().remove_route(rest).await {
            Ok(()) => Ok(status_only(StatusCode::NO_CONTENT)),
            Err(err) => storage_error(err),
        },
        _ => json_error(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed".to_string(),
        ),
    }
}

/// `Authorization: token <AUTH_TOKEN>`. With no token configured the check
/// is disabled, which only happens when the service is embedded directly;
/// the binary always configures one.
fn authorized(token: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = token else {
        return true;
    };
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    match value.trim().strip_prefix("token") {
        Some(presented) => presented.trim() == expected,
        None => false,
    }
}

/// `?inactive_since=<ISO8601>`, with `inactiveSince` accepted as an alias.
/// `Err` carries the unparseable raw value.
fn inactive_since_param(query: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    let Some(query) = query else {
        return Ok(None);
    };
    let raw = form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "inactive_since" || key == "inactiveSince")
        .map(|(_, value)| value.into_owned());
    match raw {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| raw),
    }
}

/// A storage backend failure is the API's problem, not the caller's: log it
/// and answer 500 without leaking backend detail.
fn storage_error(err: ServerError) -> ServerResult<Response<ProxyBody>> {
    error!(%err, "storage backend failure");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "storage backend failure".to_string(),
    )
}

fn json_payload<T: Serialize>(value: &T, status: StatusCode) -> Response<ProxyBody> {
    let payload = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(body::full(payload));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn json_response<T: Serialize>(value: &T, status: StatusCode) -> ServerResult<Response<ProxyBody>> {
    Ok(json_payload(value, status))
}

pub(crate) fn error_response(status: StatusCode, message: String) -> Response<ProxyBody> {
    json_payload(&ErrorResponse { error: message }, status)
}

fn json_error(status: StatusCode, message: String) -> ServerResult<Response<ProxyBody>> {
    Ok(error_response(status, message))
}

fn status_only(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(body::empty());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use http_body_util::BodyExt;
    use routetable::{
        MemoryStore, RouteMatch, RouteRecord, RouteStore, RouteUpdate, StoreError,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const TOKEN: &str = "secret-token";

    fn state() -> ProxyState {
        let config = ProxyConfig {
            auth_token: Some(TOKEN.to_string()),
            ..ProxyConfig::default()
        };
        ProxyState::new(config, Arc::new(MemoryStore::new()))
    }

    async fn call(
        state: &ProxyState,
        method: Method,
        path_and_query: &str,
        request_body: Value,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(path_and_query);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("token {token}"));
        }
        let req = builder.body(()).unwrap();
        let body = if request_body.is_null() {
            Bytes::new()
        } else {
            Bytes::from(serde_json::to_vec(&request_body).unwrap())
        };

        let response = handle_api(state, req, body).await.unwrap();
        let status = response.status();
        let collected = response.into_body().collect().await.unwrap().to_bytes();
        let payload = if collected.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&collected).unwrap()
        };
        (status, payload)
    }

    #[tokio::test]
    async fn requests_without_token_are_forbidden() {
        let state = state();
        let (status, _) = call(
            &state,
            Method::POST,
            "/api/routes/%2Fx",
            json!({"target": "http://127.0.0.1:9000"}),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // The store is unchanged.
        let (status, routes) = call(&state, Method::GET, "/api/routes", Value::Null, Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(routes, json!({}));
    }

    #[tokio::test]
    async fn wrong_token_is_forbidden() {
        let state = state();
        let (status, _) = call(&state, Method::GET, "/api/routes", Value::Null, Some("nope")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn put_creates_route_and_get_returns_it() {
        let state = state();
        let (status, _) = call(
            &state,
            Method::PUT,
            "/api/routes/%2Fhello",
            json!({"target": "http://127.0.0.1:9002", "user": "dana"}),
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, routes) = call(&state, Method::GET, "/api/routes", Value::Null, Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        let route = &routes["/hello"];
        assert_eq!(route["target"], "http://127.0.0.1:9002");
        assert_eq!(route["user"], "dana");
        assert!(route["last_activity"].is_string());

        let (status, single) = call(
            &state,
            Method::GET,
            "/api/routes/%2Fhello",
            Value::Null,
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(single["target"], "http://127.0.0.1:9002");
        assert_eq!(single["user"], "dana");
    }

    #[tokio::test]
    async fn post_on_bare_routes_path_targets_root() {
        let state = state();
        let (status, _) = call(
            &state,
            Method::POST,
            "/api/routes",
            json!({"target": "http://127.0.0.1:9000"}),
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, routes) = call(&state, Method::GET, "/api/routes", Value::Null, Some(TOKEN)).await;
        assert_eq!(routes["/"]["target"], "http://127.0.0.1:9000");
    }

    #[tokio::test]
    async fn post_without_target_is_rejected() {
        let state = state();
        let (status, payload) = call(
            &state,
            Method::POST,
            "/api/routes/%2Fx",
            json!({"user": "dana"}),
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(payload["error"].as_str().unwrap().contains("target"));
    }

    #[tokio::test]
    async fn missing_route_is_not_found() {
        let state = state();
        let (status, _) = call(
            &state,
            Method::GET,
            "/api/routes/%2Fmissing",
            Value::Null,
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let state = state();
        call(
            &state,
            Method::PUT,
            "/api/routes/%2Fgone",
            json!({"target": "http://t"}),
            Some(TOKEN),
        )
        .await;

        let (status, _) = call(
            &state,
            Method::DELETE,
            "/api/routes/%2Fgone",
            Value::Null,
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(
            &state,
            Method::DELETE,
            "/api/routes/%2Fgone",
            Value::Null,
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn invalid_inactive_since_is_a_bad_request() {
        let state = state();
        let (status, payload) = call(
            &state,
            Method::GET,
            "/api/routes?inactive_since=not-a-date",
            Value::Null,
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(payload["error"].as_str().unwrap().contains("ISO8601"));
    }

    #[tokio::test]
    async fn inactive_since_alias_is_accepted() {
        let state = state();
        let (status, routes) = call(
            &state,
            Method::GET,
            "/api/routes?inactiveSince=2020-01-01T00:00:00Z",
            Value::Null,
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(routes, json!({}));
    }

    #[tokio::test]
    async fn data_round_trips_byte_for_byte() {
        let state = state();
        let data = json!({
            "target": "http://127.0.0.1:9001",
            "user": "dana",
            "server_name": "nb-1",
            "nested": {"pool": ["a", "b"], "weight": 3}
        });
        call(&state, Method::PUT, "/api/routes/%2Fdeep", data.clone(), Some(TOKEN)).await;

        let (_, single) = call(
            &state,
            Method::GET,
            "/api/routes/%2Fdeep",
            Value::Null,
            Some(TOKEN),
        )
        .await;
        assert_eq!(single["user"], data["user"]);
        assert_eq!(single["server_name"], data["server_name"]);
        assert_eq!(single["nested"], data["nested"]);
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl RouteStore for FailingStore {
        async fn get_target(&self, _path: &str) -> routetable::Result<Option<RouteMatch>> {
            Err(StoreError::Config("backend offline".to_string()))
        }
        async fn get(&self, _prefix: &str) -> routetable::Result<Option<RouteRecord>> {
            Err(StoreError::Config("backend offline".to_string()))
        }
        async fn get_all(&self) -> routetable::Result<BTreeMap<String, RouteRecord>> {
            Err(StoreError::Config("backend offline".to_string()))
        }
        async fn add(&self, _prefix: &str, _record: RouteRecord) -> routetable::Result<()> {
            Err(StoreError::Config("backend offline".to_string()))
        }
        async fn update(&self, _prefix: &str, _update: RouteUpdate) -> routetable::Result<()> {
            Err(StoreError::Config("backend offline".to_string()))
        }
        async fn remove(&self, _prefix: &str) -> routetable::Result<()> {
            Err(StoreError::Config("backend offline".to_string()))
        }
    }

    #[tokio::test]
    async fn storage_failures_surface_as_json_500() {
        let config = ProxyConfig {
            auth_token: Some(TOKEN.to_string()),
            ..ProxyConfig::default()
        };
        let state = ProxyState::new(config, Arc::new(FailingStore));

        let (status, payload) =
            call(&state, Method::GET, "/api/routes", Value::Null, Some(TOKEN)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(payload["error"].as_str().unwrap().contains("storage"));

        let (status, _) = call(
            &state,
            Method::GET,
            "/api/routes/%2Fx",
            Value::Null,
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, _) = call(
            &state,
            Method::PUT,
            "/api/routes/%2Fx",
            json!({"target": "http://127.0.0.1:9000"}),
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, _) = call(
            &state,
            Method::DELETE,
            "/api/routes/%2Fx",
            Value::Null,
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let state = state();
        let (status, _) = call(&state, Method::GET, "/api/other", Value::Null, Some(TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&state, Method::GET, "/api/routesx", Value::Null, Some(TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
