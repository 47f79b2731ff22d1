//! Archive lookups consumed by the routing engine.

mod index;
mod remote;

pub use index::IndexGateway;
pub use remote::RemoteGateway;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use async_trait::async_trait;
use replay_proxy_common::{CollectionRef, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// One archived snapshot of a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    pub url: String,
    pub timestamp: Timestamp,
    pub collection: String,
    pub mime: String,
    pub status: u16,
}

/// Archived content ready to be returned to the client.
#[derive(Debug, Clone)]
pub struct ReplayContent {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Timestamp of the capture actually served, which may differ from the one requested
    pub timestamp: Timestamp,
    /// Live URL an archived redirect points at
    pub location: Option<String>,
}

/// Query interface of the archive.
///
/// `closest_capture` and `exists` have default implementations in terms of `list_captures`;
/// backends that can answer them more cheaply override them.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn has_collection(&self, name: &str) -> GatewayResult<bool>;

    async fn collections(&self) -> GatewayResult<Vec<String>>;

    async fn list_captures(&self, collection: &CollectionRef, url: &Url)
        -> GatewayResult<Vec<Capture>>;

    async fn exists(&self, collection: &CollectionRef, url: &Url) -> GatewayResult<bool> {
        Ok(!self.list_captures(collection, url).await?.is_empty())
    }

    async fn closest_capture(
        &self,
        collection: &CollectionRef,
        url: &Url,
        reference: &Timestamp,
    ) -> GatewayResult<Option<Timestamp>> {
        let captures = self.list_captures(collection, url).await?;
        Ok(closest(&captures, reference).map(|c| c.timestamp.clone()))
    }

    /// Content of the capture closest to `timestamp`, `None` when nothing is archived.
    async fn render(
        &self,
        collection: &CollectionRef,
        timestamp: &Timestamp,
        url: &Url,
    ) -> GatewayResult<Option<ReplayContent>>;
}

/// Build the backend named by the configuration.
pub fn from_config(config: &GatewayConfig) -> crate::Result<Arc<dyn Gateway>> {
    match config {
        GatewayConfig::Index { path } => {
            Ok(Arc::new(IndexGateway::from_file(std::path::Path::new(path))?))
        }
        GatewayConfig::Remote {
            base_url,
            collections,
            aggregate_collection,
        } => Ok(Arc::new(RemoteGateway::new(
            base_url,
            collections.clone(),
            aggregate_collection,
        )?)),
    }
}

/// Capture nearest in time to `reference`; ties go to the earlier capture.
pub fn closest<'a>(captures: &'a [Capture], reference: &Timestamp) -> Option<&'a Capture> {
    captures.iter().min_by(|a, b| {
        let da = a.timestamp.distance_secs(reference).unwrap_or(i64::MAX);
        let db = b.timestamp.distance_secs(reference).unwrap_or(i64::MAX);
        da.cmp(&db)
            .then_with(|| a.timestamp.padded().cmp(&b.timestamp.padded()))
    })
}

/// Sorted, de-duplicated capture timestamps.
pub fn distinct_timestamps(captures: &[Capture]) -> Vec<Timestamp> {
    let mut timestamps: Vec<Timestamp> = captures.iter().map(|c| c.timestamp.clone()).collect();
    timestamps.sort_by_key(|ts| ts.padded());
    timestamps.dedup_by(|a, b| a.padded() == b.padded());
    timestamps
}

/// Scheme-agnostic lookup key: host, non-default port, path and query.
pub fn url_key(url: &Url) -> String {
    let mut key = url.host_str().unwrap_or_default().to_ascii_lowercase();
    if let Some(port) = url.port() {
        key.push(':');
        key.push_str(&port.to_string());
    }
    key.push_str(url.path());
    if let Some(query) = url.query() {
        key.push('?');
        key.push_str(query);
    }
    key
}

/// [`url_key`] with `_` cache-busting query parameters dropped.
pub fn fuzzy_key(url: &Url) -> String {
    let mut stripped = url.clone();
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| name != "_")
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(kept);
    }
    url_key(&stripped)
}
