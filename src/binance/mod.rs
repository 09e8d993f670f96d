pub mod client;
pub mod endpoints;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::error::SyncResult;

pub use client::FuturesClient;
pub use endpoints::KlineQuery;

/// Verb-level access to the futures REST API.
///
/// Implementations return the parsed JSON body as-is. The exchange error
/// shape `{code, msg}` is *not* turned into an error here; callers run the
/// body through [`endpoints::check_exchange_error`].
#[async_trait]
pub trait RestClient: Send + Sync {
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> SyncResult<Value>;

    async fn get(&self, endpoint: &str, params: &[(&str, String)]) -> SyncResult<Value> {
        self.send(Method::GET, endpoint, params).await
    }

    async fn post(&self, endpoint: &str, params: &[(&str, String)]) -> SyncResult<Value> {
        self.send(Method::POST, endpoint, params).await
    }

    async fn put(&self, endpoint: &str, params: &[(&str, String)]) -> SyncResult<Value> {
        self.send(Method::PUT, endpoint, params).await
    }

    async fn delete(&self, endpoint: &str, params: &[(&str, String)]) -> SyncResult<Value> {
        self.send(Method::DELETE, endpoint, params).await
    }
}
