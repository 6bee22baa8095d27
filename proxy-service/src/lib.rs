//! Dynamic reverse proxy for HTTP and WebSocket traffic.
//!
//! A routing table maps URL path prefixes to upstream origins. The data
//! plane forwards each request to the upstream with the longest matching
//! prefix; the control plane is a separate authenticated HTTP API that
//! mutates the table at runtime, with no restart required.

pub mod body;
pub mod config;
pub mod error;
pub mod proxy;
pub mod server;
pub mod storage;

pub use body::ProxyBody;
pub use config::ProxyConfig;
pub use error::{ServerError, ServerResult};
pub use proxy::state::ProxyState;
pub use server::{ProxyService, ServerHandle};
pub use storage::StoreRegistry;
