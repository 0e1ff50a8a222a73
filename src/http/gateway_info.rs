use crate::error::Result;
use crate::http::client::Http;
use crate::http::request::RequestOptions;
use crate::http::route::{Method, Route};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: u64,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotGatewayInfo {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// Gateway discovery endpoints.
#[derive(Debug, Clone)]
pub struct GatewayApi {
    http: Http,
}

impl GatewayApi {
    pub fn new(http: Http) -> Self {
        Self { http }
    }

    pub async fn get_gateway(&self) -> Result<GatewayInfo> {
        let route = Route::new(Method::Get, "/gateway");
        self.http.request_json(&route, RequestOptions::new()).await
    }

    pub async fn get_gateway_bot(&self) -> Result<BotGatewayInfo> {
        let route = Route::new(Method::Get, "/gateway/bot");
        self.http.request_json(&route, RequestOptions::new()).await
    }
}
