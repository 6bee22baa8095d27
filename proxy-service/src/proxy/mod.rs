pub mod api;
pub mod engine;
pub mod error_page;
pub mod headers;
pub mod routes;
pub mod state;

/// Liveness probe path served directly by the data plane.
pub const HEALTH_CHECK_PATH: &str = "/_chp_healthz";

pub use routes::RouteTable;
pub use state::ProxyState;
