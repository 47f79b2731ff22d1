//! Built-in HTML pages and static assets served on the magic domains.

use crate::config::{RoutingConfig, P12_DOWNLOAD_PATH, PEM_DOWNLOAD_PATH};
use crate::target::{collection_url, timestamp_url};
use replay_proxy_common::{CollectionRef, Timestamp};
use std::path::{Component, Path};
use url::Url;

const REPLAY_JS: &str = r#"// Replay banner for proxied pages.
function init_banner() {
  if (document.getElementById("_replay_banner")) {
    return;
  }
  var banner = document.createElement("div");
  banner.id = "_replay_banner";
  banner.className = "replay-banner";
  var info = window.replay_info || {};
  banner.textContent = "Archived " + (info.url || document.location.href) +
    (info.timestamp ? " at " + info.timestamp : "");
  document.body.insertBefore(banner, document.body.firstChild);
}
document.addEventListener("DOMContentLoaded", init_banner);
"#;

const REPLAY_CSS: &str = r#".replay-banner {
  position: fixed;
  top: 0;
  left: 0;
  right: 0;
  padding: 4px 8px;
  font: 12px sans-serif;
  background: #fffbe6;
  border-bottom: 1px solid #c9b458;
  z-index: 2147483647;
}
"#;

/// A static asset ready to be returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Look up `/static/<name>`, preferring `static_dir` over the built-in assets.
pub async fn static_asset(static_dir: Option<&str>, path: &str) -> Option<Asset> {
    let name = path.strip_prefix("/static/")?;
    if !is_safe_relative(name) {
        return None;
    }

    if let Some(dir) = static_dir {
        let on_disk = Path::new(dir).join(name);
        if let Ok(body) = tokio::fs::read(&on_disk).await {
            return Some(Asset {
                content_type: content_type_for(name).to_string(),
                body,
            });
        }
    }

    let body = match name {
        "replay.js" => REPLAY_JS,
        "replay.css" => REPLAY_CSS,
        _ => return None,
    };
    Some(Asset {
        content_type: content_type_for(name).to_string(),
        body: body.as_bytes().to_vec(),
    })
}

fn is_safe_relative(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('\\')
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit('.').next() {
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("html") => "text/html; charset=utf-8",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

pub fn landing_page(routing: &RoutingConfig) -> String {
    page(
        "Replay Proxy",
        &format!(
            "<h1>Replay Proxy</h1>\n\
             <p>Configure your browser to use this proxy, then trust its certificate authority \
             to browse archived HTTPS sites.</p>\n\
             <ul>\n\
             <li><a href=\"{pem}\">Download Certificate (PEM)</a> for most browsers</li>\n\
             <li><a href=\"{p12}\">Download Certificate (PKCS12)</a> for Windows and Firefox</li>\n\
             </ul>\n\
             <p>Pick a collection at <a href=\"http://{select}/\">{select}</a>.</p>",
            pem = PEM_DOWNLOAD_PATH,
            p12 = P12_DOWNLOAD_PATH,
            select = escape(&routing.select_host()),
        ),
    )
}

/// Collection picker for `suffix`, the marked target the client asked for.
pub fn selection_page(
    routing: &RoutingConfig,
    scheme: &str,
    suffix: &str,
    collections: &[String],
    no_captures: bool,
    notice: Option<&str>,
) -> String {
    let mut body = String::from("<h1>Select a collection</h1>\n");
    if let Some(notice) = notice {
        body.push_str(&format!("<p class=\"notice\">{}</p>\n", escape(notice)));
    }
    if no_captures {
        body.push_str(&format!(
            "<p class=\"notice\">No captures of <code>{}</code> in the selected collection.</p>\n",
            escape(suffix)
        ));
    }
    if !suffix.is_empty() {
        body.push_str(&format!("<p>Target: <code>{}</code></p>\n", escape(suffix)));
    }

    body.push_str("<ul>\n");
    for name in collections {
        body.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            escape(&collection_url(routing, scheme, name, suffix)),
            escape(name)
        ));
    }
    body.push_str(&format!(
        "<li><a href=\"{}\">All collections</a></li>\n</ul>",
        escape(&collection_url(routing, scheme, &routing.aggregate_label, suffix))
    ));
    page("Select a collection", &body)
}

pub fn listing_page(
    routing: &RoutingConfig,
    scheme: &str,
    collection: &CollectionRef,
    target: &Url,
    timestamps: &[Timestamp],
) -> String {
    let mut body = format!(
        "<h1>Captures of <code>{}</code></h1>\n<p><b>{}</b> captures in {}</p>\n<ul>\n",
        escape(target.as_str()),
        timestamps.len(),
        escape(&collection.to_string())
    );
    for ts in timestamps {
        let label = ts
            .to_datetime()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| ts.to_string());
        body.push_str(&format!(
            "<li><a href=\"{}\">{}</a> ({})</li>\n",
            escape(&timestamp_url(routing, scheme, ts, target.as_str())),
            ts,
            label
        ));
    }
    body.push_str("</ul>");
    page("Capture listing", &body)
}

pub fn bad_request_page(reason: &str) -> String {
    page(
        "Bad request",
        &format!("<h1>Bad request</h1>\n<p>{}</p>", escape(reason)),
    )
}

pub fn unavailable_page(reason: &str) -> String {
    page(
        "Archive unavailable",
        &format!(
            "<h1>Archive unavailable</h1>\n<p>{}</p>\n<p>Try again shortly.</p>",
            escape(reason)
        ),
    )
}

pub fn not_found_page(path: &str) -> String {
    page(
        "Not found",
        &format!("<h1>Not found</h1>\n<p><code>{}</code></p>", escape(path)),
    )
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n\
         <link rel=\"stylesheet\" href=\"/static/replay.css\">\n</head>\n<body>\n{}\n</body>\n</html>\n",
        escape(title),
        body
    )
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing() -> RoutingConfig {
        RoutingConfig::with_root_domain("pywb.proxy")
    }

    #[test]
    fn test_landing_offers_downloads() {
        let html = landing_page(&routing());
        assert!(html.contains("Download"));
        assert!(html.contains(PEM_DOWNLOAD_PATH));
        assert!(html.contains(P12_DOWNLOAD_PATH));
    }

    #[test]
    fn test_selection_links_every_collection() {
        let html = selection_page(
            &routing(),
            "https",
            "https://iana.org/",
            &["all-set".to_string(), "older-set".to_string()],
            false,
            None,
        );
        assert!(html.contains("href=\"https://older-set.pywb.proxy/https://iana.org/\""));
        assert!(html.contains("href=\"https://all-set.pywb.proxy/https://iana.org/\""));
        assert!(html.contains("href=\"https://all.pywb.proxy/https://iana.org/\""));
    }

    #[test]
    fn test_selection_escapes_target() {
        let html = selection_page(&routing(), "http", "x.org/<script>", &[], true, Some("a&b"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("a&amp;b"));
        assert!(html.contains("No captures"));
    }

    #[test]
    fn test_listing_counts_and_links() {
        let target = Url::parse("https://iana.org/").unwrap();
        let timestamps = vec![
            Timestamp::parse("20140126200624").unwrap(),
            Timestamp::parse("20140127171238").unwrap(),
        ];
        let html = listing_page(
            &routing(),
            "https",
            &CollectionRef::Named("all-set".to_string()),
            &target,
            &timestamps,
        );
        assert!(html.contains("<b>2</b> captures"));
        assert!(html.contains("https://query.pywb.proxy/20140126200624/https://iana.org/"));
        assert!(html.contains("2014-01-27 17:12:38"));
    }

    #[tokio::test]
    async fn test_builtin_static_assets() {
        let asset = static_asset(None, "/static/replay.js").await.unwrap();
        assert_eq!(asset.content_type, "application/javascript");
        assert!(String::from_utf8(asset.body).unwrap().contains("function init_banner"));

        assert!(static_asset(None, "/static/missing.js").await.is_none());
        assert!(static_asset(None, "/other/replay.js").await.is_none());
    }

    #[tokio::test]
    async fn test_static_dir_overrides_and_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("replay.css"), "body {}").unwrap();
        let dir_str = dir.path().to_str().unwrap();

        let asset = static_asset(Some(dir_str), "/static/replay.css").await.unwrap();
        assert_eq!(asset.body, b"body {}");
        assert_eq!(asset.content_type, "text/css");

        assert!(static_asset(Some(dir_str), "/static/../secret").await.is_none());
        assert!(static_asset(Some(dir_str), "/static//etc/passwd").await.is_none());
    }
}
