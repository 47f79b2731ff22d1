//! pywb-compatible HTTP backend: CDX queries for lookups, the replay endpoint for content.

use super::{Capture, Gateway, GatewayResult, ReplayContent};
use crate::error::{GatewayError, ProxyError};
use async_trait::async_trait;
use replay_proxy_common::{CollectionRef, Timestamp};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use url::Url;

/// One NDJSON line of `output=json` CDX results.
#[derive(Debug, Deserialize)]
struct CdxLine {
    timestamp: String,
    url: String,
    #[serde(default)]
    mime: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

pub struct RemoteGateway {
    client: reqwest::Client,
    base_url: String,
    collections: Vec<String>,
    aggregate_collection: String,
}

impl RemoteGateway {
    pub fn new(
        base_url: &str,
        collections: Vec<String>,
        aggregate_collection: &str,
    ) -> crate::Result<Self> {
        let parsed = Url::parse(base_url).map_err(|e| {
            ProxyError::Configuration(format!("Invalid gateway base_url {}: {}", base_url, e))
        })?;
        let mut base_url = parsed.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        // Archived redirects are handed to the browser, not followed here.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Network(format!("Failed to build gateway client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            collections,
            aggregate_collection: aggregate_collection.to_string(),
        })
    }

    fn backend_collection<'a>(&'a self, collection: &'a CollectionRef) -> &'a str {
        match collection {
            CollectionRef::Named(name) => name,
            CollectionRef::All => &self.aggregate_collection,
        }
    }

    async fn cdx(
        &self,
        collection: &CollectionRef,
        url: &Url,
        extra: &[(&str, &str)],
    ) -> GatewayResult<Vec<Capture>> {
        let coll = self.backend_collection(collection);
        let mut endpoint = Url::parse(&format!("{}{}/cdx", self.base_url, coll))
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        {
            let mut pairs = endpoint.query_pairs_mut();
            pairs.append_pair("url", url.as_str());
            pairs.append_pair("output", "json");
            for (name, value) in extra {
                pairs.append_pair(name, value);
            }
        }
        debug!("CDX query {}", endpoint);

        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        check_status(status)?;
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_cdx_line(coll, line))
            .collect()
    }
}

fn parse_cdx_line(collection: &str, line: &str) -> GatewayResult<Capture> {
    let cdx: CdxLine = serde_json::from_str(line)
        .map_err(|e| GatewayError::Protocol(format!("bad CDX line {:?}: {}", line, e)))?;
    let timestamp = Timestamp::parse(&cdx.timestamp)
        .map_err(|e| GatewayError::Protocol(e.to_string()))?;
    Ok(Capture {
        url: cdx.url,
        timestamp,
        collection: collection.to_string(),
        mime: cdx.mime.unwrap_or_else(|| "text/html".to_string()),
        status: cdx
            .status
            .and_then(|s| s.parse().ok())
            .unwrap_or(200),
    })
}

fn check_status(status: StatusCode) -> GatewayResult<()> {
    if status.is_server_error() {
        Err(GatewayError::Unavailable(format!("backend answered {}", status)))
    } else if !status.is_success() {
        Err(GatewayError::Protocol(format!("backend answered {}", status)))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Gateway for RemoteGateway {
    async fn has_collection(&self, name: &str) -> GatewayResult<bool> {
        Ok(self.collections.iter().any(|c| c == name))
    }

    async fn collections(&self) -> GatewayResult<Vec<String>> {
        Ok(self.collections.clone())
    }

    async fn list_captures(
        &self,
        collection: &CollectionRef,
        url: &Url,
    ) -> GatewayResult<Vec<Capture>> {
        self.cdx(collection, url, &[]).await
    }

    async fn closest_capture(
        &self,
        collection: &CollectionRef,
        url: &Url,
        reference: &Timestamp,
    ) -> GatewayResult<Option<Timestamp>> {
        let captures = self
            .cdx(
                collection,
                url,
                &[
                    ("closest", reference.as_str()),
                    ("sort", "closest"),
                    ("limit", "1"),
                ],
            )
            .await?;
        Ok(captures.into_iter().next().map(|c| c.timestamp))
    }

    async fn render(
        &self,
        collection: &CollectionRef,
        timestamp: &Timestamp,
        url: &Url,
    ) -> GatewayResult<Option<ReplayContent>> {
        let coll = self.backend_collection(collection);
        let endpoint = format!("{}{}/{}/{}", self.base_url, coll, timestamp, url);
        debug!("Replay fetch {}", endpoint);

        let response = self
            .client
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_server_error() {
            return Err(GatewayError::Unavailable(format!("backend answered {}", status)));
        }

        let headers = response.headers();
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let served = headers
            .get("memento-datetime")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| Timestamp::from_datetime(dt.with_timezone(&chrono::Utc)))
            .unwrap_or_else(|| timestamp.clone());
        let location = headers
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| live_location(url, v));

        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Ok(Some(ReplayContent {
            status: status.as_u16(),
            content_type,
            body: body.to_vec(),
            timestamp: served,
            location,
        }))
    }
}

/// The live URL behind a replay-rewritten `Location` such as `/web/2014.../http://www.iana.org/`.
fn live_location(requested: &Url, location: &str) -> Option<String> {
    let embedded = ["/http://", "/https://"]
        .iter()
        .filter_map(|marker| location.find(marker))
        .min();
    match embedded {
        Some(at) => Some(location[at + 1..].to_string()),
        None => requested.join(location).ok().map(|u| u.to_string()),
    }
}
