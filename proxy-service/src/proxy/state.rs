use std::sync::Arc;

use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use routetable::RouteStore;

use crate::body::ProxyBody;
use crate::config::ProxyConfig;
use crate::proxy::error_page::ErrorPages;
use crate::proxy::routes::RouteTable;

/// Pooled client used for upstream requests and error-target sub-requests.
/// Upstreams are plain `http`; `ws` targets are dialed over the same
/// connector after scheme mapping.
pub type UpstreamClient = Client<HttpConnector, ProxyBody>;

/// Everything a request handler needs, shared across connections.
pub struct ProxyState {
    config: ProxyConfig,
    routes: RouteTable,
    client: UpstreamClient,
    error_pages: ErrorPages,
}

impl ProxyState {
    pub fn new(config: ProxyConfig, store: Arc<dyn RouteStore>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let error_pages = ErrorPages::new(
            config.error_target.clone(),
            config.error_path.clone(),
            client.clone(),
        );
        Self {
            config,
            routes: RouteTable::new(store),
            client,
            error_pages,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn client(&self) -> &UpstreamClient {
        &self.client
    }

    pub fn error_pages(&self) -> &ErrorPages {
        &self.error_pages
    }
}
