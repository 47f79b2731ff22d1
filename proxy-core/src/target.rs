//! Host and path grammar of proxied requests.
//!
//! Hosts under the root domain are "magic" and select a routing branch. Paths on the query
//! domain, on collection domains and (with stricter rules) on literal domains may carry a
//! leading `*` listing marker or a timestamp segment in front of the target URL.

use crate::config::RoutingConfig;
use replay_proxy_common::{CollectionRef, Timestamp};
use url::Url;

/// Path prefix a literal domain uses to redeem a cookie handoff token.
pub const HANDOFF_PREFIX: &str = "/__replay_proxy_sesh__/";

/// Routing branch selected by the request host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKind {
    /// The root domain itself: landing page, static assets, certificate downloads
    Root,
    Select,
    Query,
    Auto,
    /// `<name>.<root>`, including the aggregate label
    Collection(CollectionRef),
    /// Any host outside the root domain, reached through interception
    Literal,
}

impl HostKind {
    pub fn classify(routing: &RoutingConfig, host: &str) -> Self {
        if !routing.is_magic_host(host) {
            return HostKind::Literal;
        }
        let host = host.trim_end_matches('.');
        if host.len() == routing.root_domain.len() {
            return HostKind::Root;
        }
        // `is_magic_host` guarantees `<label>.<root>` here.
        let label = host[..host.len() - routing.root_domain.len() - 1].to_ascii_lowercase();
        match label.as_str() {
            "select" => HostKind::Select,
            "query" => HostKind::Query,
            "auto" => HostKind::Auto,
            _ if label == routing.aggregate_label => HostKind::Collection(CollectionRef::All),
            _ => HostKind::Collection(CollectionRef::Named(label)),
        }
    }
}

/// Leading path segment in front of a target URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Bare,
    /// `*/<url>`: list captures
    Listing,
    /// `<digits>/<url>`: replay at this timestamp
    Timestamp(Timestamp),
}

/// Split a marker off `rest` (a path without its leading slash).
///
/// With `require_absolute`, the marker only counts when an absolute `http(s)://` URL follows
/// it, which keeps ordinary site paths like `2014/01/post` on literal domains intact.
pub fn split_marker(rest: &str, require_absolute: bool) -> (Marker, &str) {
    let Some((head, tail)) = rest.split_once('/') else {
        return (Marker::Bare, rest);
    };
    let marker = if head == "*" {
        Marker::Listing
    } else if let Ok(ts) = Timestamp::parse(head) {
        Marker::Timestamp(ts)
    } else {
        return (Marker::Bare, rest);
    };
    if require_absolute && !has_http_scheme(tail) {
        return (Marker::Bare, rest);
    }
    (marker, tail)
}

/// Path and query of a magic-domain request, rejoined without the leading slash.
pub fn path_rest(path: &str, query: Option<&str>) -> String {
    let path = path.strip_prefix('/').unwrap_or(path);
    match query {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    }
}

/// Turn the remainder of a magic path into an absolute URL.
///
/// A remainder without a scheme inherits the scheme the request itself used.
pub fn absolute_url(rest: &str, scheme: &str) -> Option<Url> {
    if rest.is_empty() {
        return None;
    }
    let url = if has_http_scheme(rest) {
        Url::parse(rest).ok()?
    } else {
        Url::parse(&format!("{}://{}", scheme, rest)).ok()?
    };
    url.host_str()?;
    Some(url)
}

/// The URL a literal-domain request addresses, exactly as the client asked for it.
pub fn request_url(
    scheme: &str,
    host: &str,
    port: Option<u16>,
    path: &str,
    query: Option<&str>,
) -> Option<Url> {
    let authority = match port {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let path = if path.is_empty() { "/" } else { path };
    let raw = match query {
        Some(q) => format!("{}://{}{}?{}", scheme, authority, path, q),
        None => format!("{}://{}{}", scheme, authority, path),
    };
    Url::parse(&raw).ok()
}

/// Re-prefix a target with its marker, as it appears after a magic host.
pub fn marked_suffix(marker: &Marker, target: &str) -> String {
    match marker {
        Marker::Bare => target.to_string(),
        Marker::Listing => format!("*/{}", target),
        Marker::Timestamp(ts) => format!("{}/{}", ts, target),
    }
}

/// `scheme://select.<root>/<suffix>`
pub fn selection_url(routing: &RoutingConfig, scheme: &str, suffix: &str) -> String {
    format!("{}://{}/{}", scheme, routing.select_host(), suffix)
}

/// `scheme://query.<root>/*/<target>`
pub fn listing_url(routing: &RoutingConfig, scheme: &str, target: &Url) -> String {
    format!("{}://{}/*/{}", scheme, routing.query_host(), target)
}

/// `scheme://query.<root>/<ts>/<target>`
pub fn timestamp_url(routing: &RoutingConfig, scheme: &str, ts: &Timestamp, target: &str) -> String {
    format!("{}://{}/{}/{}", scheme, routing.query_host(), ts, target)
}

/// `scheme://<label>.<root>/<suffix>`
pub fn collection_url(routing: &RoutingConfig, scheme: &str, label: &str, suffix: &str) -> String {
    format!("{}://{}/{}", scheme, routing.magic_host(label), suffix)
}

/// Landing URL on the target's own host that redeems `token`.
pub fn handoff_url(target: &Url, token: &str) -> String {
    let mut url = target.clone();
    url.set_path(&format!("{}{}", HANDOFF_PREFIX, token));
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

fn has_http_scheme(raw: &str) -> bool {
    let lower = raw.get(..8).unwrap_or(raw).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
