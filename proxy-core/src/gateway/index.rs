//! Capture index held in memory, loaded from a JSON file.
//!
//! ```json
//! { "collections": { "web": [ { "url": "http://iana.org/", "timestamp": "20140126200624" } ] } }
//! ```

use super::{closest, fuzzy_key, url_key, Capture, Gateway, GatewayResult, ReplayContent};
use crate::error::ProxyError;
use async_trait::async_trait;
use replay_proxy_common::{CollectionRef, Timestamp};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;
use url::Url;

#[derive(Debug, Deserialize)]
struct IndexFile {
    collections: BTreeMap<String, Vec<IndexEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
struct IndexEntry {
    url: String,
    timestamp: Timestamp,
    #[serde(default = "default_mime")]
    mime: String,
    #[serde(default = "default_status")]
    status: u16,
    /// Archived body; a placeholder page is rendered when absent
    #[serde(default)]
    body: Option<String>,
    /// Target of an archived redirect
    #[serde(default)]
    location: Option<String>,
}

fn default_mime() -> String {
    "text/html".to_string()
}

fn default_status() -> u16 {
    200
}

struct Indexed {
    capture: Capture,
    body: Option<String>,
    location: Option<String>,
}

pub struct IndexGateway {
    /// collection -> url key -> captures
    collections: BTreeMap<String, HashMap<String, Vec<Indexed>>>,
}

impl IndexGateway {
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Configuration(format!("Cannot read index {}: {}", path.display(), e))
        })?;
        let gateway = Self::from_json(&raw)?;
        info!(
            "Loaded capture index {} with {} collections",
            path.display(),
            gateway.collections.len()
        );
        Ok(gateway)
    }

    pub fn from_json(raw: &str) -> crate::Result<Self> {
        let file: IndexFile = serde_json::from_str(raw)
            .map_err(|e| ProxyError::Configuration(format!("Invalid capture index: {}", e)))?;

        let mut collections = BTreeMap::new();
        for (name, entries) in file.collections {
            let mut by_url: HashMap<String, Vec<Indexed>> = HashMap::new();
            for entry in entries {
                let url = Url::parse(&entry.url).map_err(|e| {
                    ProxyError::Configuration(format!("Invalid url {} in {}: {}", entry.url, name, e))
                })?;
                by_url.entry(url_key(&url)).or_default().push(Indexed {
                    capture: Capture {
                        url: entry.url,
                        timestamp: entry.timestamp,
                        collection: name.clone(),
                        mime: entry.mime,
                        status: entry.status,
                    },
                    body: entry.body,
                    location: entry.location,
                });
            }
            collections.insert(name, by_url);
        }
        Ok(Self { collections })
    }

    /// Exact matches, or failing those, matches once cache busters are ignored.
    fn matching<'a>(&'a self, collection: &CollectionRef, url: &Url) -> Vec<&'a Indexed> {
        let exact = self.matching_key(collection, &url_key(url));
        if !exact.is_empty() {
            return exact;
        }
        let fuzzy = fuzzy_key(url);
        if fuzzy == url_key(url) {
            return exact;
        }
        self.matching_key(collection, &fuzzy)
    }

    fn matching_key<'a>(&'a self, collection: &CollectionRef, key: &str) -> Vec<&'a Indexed> {
        let lookup = |by_url: &'a HashMap<String, Vec<Indexed>>| {
            by_url.get(key).into_iter().flatten()
        };
        match collection {
            CollectionRef::Named(name) => self
                .collections
                .get(name)
                .into_iter()
                .flat_map(lookup)
                .collect(),
            CollectionRef::All => self.collections.values().flat_map(lookup).collect(),
        }
    }
}

#[async_trait]
impl Gateway for IndexGateway {
    async fn has_collection(&self, name: &str) -> GatewayResult<bool> {
        Ok(self.collections.contains_key(name))
    }

    async fn collections(&self) -> GatewayResult<Vec<String>> {
        Ok(self.collections.keys().cloned().collect())
    }

    async fn list_captures(
        &self,
        collection: &CollectionRef,
        url: &Url,
    ) -> GatewayResult<Vec<Capture>> {
        let mut captures: Vec<Capture> = self
            .matching(collection, url)
            .into_iter()
            .map(|indexed| indexed.capture.clone())
            .collect();
        captures.sort_by_key(|c| c.timestamp.padded());
        Ok(captures)
    }

    async fn render(
        &self,
        collection: &CollectionRef,
        timestamp: &Timestamp,
        url: &Url,
    ) -> GatewayResult<Option<ReplayContent>> {
        let matching = self.matching(collection, url);
        let captures: Vec<Capture> = matching.iter().map(|i| i.capture.clone()).collect();
        let Some(best) = closest(&captures, timestamp) else {
            return Ok(None);
        };
        let indexed = matching
            .iter()
            .find(|i| i.capture == *best)
            .copied();

        let body = indexed
            .and_then(|i| i.body.clone())
            .unwrap_or_else(|| placeholder(url, &best.timestamp));
        Ok(Some(ReplayContent {
            status: best.status,
            content_type: best.mime.clone(),
            body: body.into_bytes(),
            timestamp: best.timestamp.clone(),
            location: indexed.and_then(|i| i.location.clone()),
        }))
    }
}

fn placeholder(url: &Url, timestamp: &Timestamp) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>{url}</title></head>\n<body>\n\
         <p>Archived copy of {url} captured at {ts}</p>\n</body></html>\n",
        url = url,
        ts = timestamp
    )
}
