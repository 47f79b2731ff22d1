use replay_proxy_core::{
    CertificateAuthority, GatewayConfig, ProxyConfig, ProxyServer, RoutingConfig,
};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::TcpStream;

const PROXY_PORT: u16 = 19480;
const ADMIN_PORT: u16 = 19481;
const COOKIE_NAME: &str = "__replay_proxy_sesh";

fn proxy_client(ca_pem: &[u8], jar: Option<Arc<Jar>>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://127.0.0.1:{}", PROXY_PORT)).unwrap())
        .add_root_certificate(reqwest::Certificate::from_pem(ca_pem).unwrap())
        .timeout(Duration::from_secs(10));
    if let Some(jar) = jar {
        builder = builder.cookie_provider(jar);
    }
    builder.build().unwrap()
}

fn jar_value(jar: &Jar, url: &str) -> Option<String> {
    let header = jar.cookies(&url.parse().unwrap())?;
    header
        .to_str()
        .ok()?
        .split("; ")
        .find_map(|pair| pair.strip_prefix(&format!("{}=", COOKIE_NAME)))
        .map(str::to_string)
}

async fn fetch(client: &reqwest::Client, url: &str) -> (reqwest::Response, String) {
    let resp = client.get(url).send().await.unwrap();
    assert_eq!(resp.status(), 200, "status for {}", url);
    assert!(resp.headers().contains_key(CONTENT_LENGTH), "length for {}", url);
    let final_url = resp.url().to_string();
    (resp, final_url)
}

async fn fetch_text(client: &reqwest::Client, url: &str, expected_url: &str) -> String {
    let (resp, final_url) = fetch(client, url).await;
    assert_eq!(final_url, expected_url, "final url for {}", url);
    resp.text().await.unwrap()
}

#[tokio::test]
async fn test_browse_archive_through_proxy() {
    let dir = tempdir().unwrap();
    let ca = CertificateAuthority::new(dir.path()).unwrap();
    let ca_pem = ca.ca_cert_pem().as_bytes().to_vec();

    let config = ProxyConfig {
        listen_address: "127.0.0.1".to_string(),
        listen_port: PROXY_PORT,
        admin_port: ADMIN_PORT,
        routing: RoutingConfig::with_root_domain("pywb.proxy"),
        gateway: GatewayConfig::Index {
            path: concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/archive-index.json")
                .to_string(),
        },
        ..Default::default()
    };

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = ProxyServer::new(config, ca);
    let handle = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = stop_rx.await;
            })
            .await
    });

    // Wait for server to start
    let addr = format!("127.0.0.1:{}", PROXY_PORT);
    let mut started = false;
    for _ in 0..50 {
        if TcpStream::connect(&addr).await.is_ok() {
            started = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(started, "proxy never listened on {}", addr);

    let jar = Arc::new(Jar::default());
    let client = proxy_client(&ca_pem, Some(jar.clone()));

    // No session yet: bounced to the selection page.
    fetch_text(
        &client,
        "https://iana.org/",
        "https://select.pywb.proxy/https://iana.org/",
    )
    .await;

    // Pinning a collection lands on the bare URL with the cookie on both domains.
    let text = fetch_text(
        &client,
        "https://older-set.pywb.proxy/https://iana.org/",
        "https://iana.org/",
    )
    .await;
    assert!(text.contains("20140126200624"));
    let key = jar_value(&jar, "https://select.pywb.proxy/").expect("cookie on pywb.proxy");
    assert_eq!(jar_value(&jar, "https://iana.org/"), Some(key.clone()));

    let text = fetch_text(&client, "https://iana.org/", "https://iana.org/").await;
    assert!(text.contains("20140126200624"));

    // Change collection, same session.
    let text = fetch_text(
        &client,
        "https://all-set.pywb.proxy/https://iana.org/",
        "https://iana.org/",
    )
    .await;
    assert!(text.contains("20140127171238"));
    assert_eq!(jar_value(&jar, "https://iana.org/"), Some(key.clone()));

    // Capture listing.
    let (resp, final_url) = fetch(&client, "https://query.pywb.proxy/*/https://iana.org/").await;
    assert_eq!(final_url, "https://query.pywb.proxy/*/https://iana.org/");
    assert!(resp.headers()[CONTENT_TYPE]
        .to_str()
        .unwrap()
        .contains("text/html"));
    let text = resp.text().await.unwrap();
    assert!(text.contains("20140126200624"));
    assert!(text.contains("20140127171238"));
    assert!(text.contains("<b>2</b> captures"));

    // Explicit timestamp over plain http.
    let text = fetch_text(
        &client,
        "http://query.pywb.proxy/20140126200624/http://iana.org/",
        "http://iana.org/",
    )
    .await;
    assert!(text.contains("20140126200624"));

    // Re-pinning keeps the collection's sticky timestamp.
    let text = fetch_text(
        &client,
        "https://all-set.pywb.proxy/iana.org/",
        "https://iana.org/",
    )
    .await;
    assert!(text.contains("20140126200624"));

    // A bare query-domain visit refreshes to the latest capture.
    let text = fetch_text(
        &client,
        "http://query.pywb.proxy/http://iana.org/?_=1234",
        "http://iana.org/?_=1234",
    )
    .await;
    assert!(text.contains("20140127171238"));

    // Another domain, cookie supplied by hand since the jar has none for it.
    let cookie = format!("{}={}", COOKIE_NAME, key);
    let resp = client
        .get("https://example.com/")
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.url().as_str(), "https://example.com/");
    assert!(resp.text().await.unwrap().contains("20140127171251"));
    assert_eq!(jar_value(&jar, "https://example.com/"), Some(key.clone()));

    let resp = client
        .post("https://httpbin.org/post")
        .header(COOKIE, &cookie)
        .form(&[("foo", "bar"), ("test", "abc")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.url().as_str(), "https://httpbin.org/post");
    assert!(resp.headers()[CONTENT_TYPE]
        .to_str()
        .unwrap()
        .contains("application/json"));

    // Without a session everything bounces back to selection.
    let fresh = proxy_client(&ca_pem, None);
    let bounces = [
        (
            "https://query.pywb.proxy/https://iana.org/",
            "https://select.pywb.proxy/https://iana.org/",
        ),
        (
            "https://auto.pywb.proxy/https://iana.org/",
            "https://select.pywb.proxy/https://iana.org/",
        ),
        (
            "https://query.pywb.proxy/20140126200624/https://iana.org/",
            "https://select.pywb.proxy/20140126200624/https://iana.org/",
        ),
        (
            "https://query.pywb.proxy/*/https://iana.org/",
            "https://select.pywb.proxy/https://query.pywb.proxy/*/https://iana.org/",
        ),
    ];
    for (url, expected) in bounces {
        fetch_text(&fresh, url, expected).await;
    }

    // Root domain: static asset, landing page, certificate downloads.
    let text = fetch_text(
        &fresh,
        "https://pywb.proxy/static/replay.js",
        "https://pywb.proxy/static/replay.js",
    )
    .await;
    assert!(text.contains("function init_banner"));

    let (resp, _) = fetch(&fresh, "https://pywb.proxy/").await;
    assert!(resp.headers()[CONTENT_TYPE]
        .to_str()
        .unwrap()
        .contains("text/html"));
    assert!(resp.text().await.unwrap().contains("Download"));

    let (resp, _) = fetch(&fresh, "https://pywb.proxy/replay-proxy-ca.pem").await;
    assert_eq!(resp.headers()[CONTENT_TYPE], "application/x-x509-ca-cert");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), ca_pem.as_slice());

    let (resp, _) = fetch(&fresh, "https://pywb.proxy/replay-proxy-ca.p12").await;
    assert_eq!(resp.headers()[CONTENT_TYPE], "application/x-pkcs12");

    // Verify Admin API (Health)
    let health_url = format!("http://127.0.0.1:{}/health", ADMIN_PORT);
    let resp = reqwest::get(&health_url).await.unwrap();
    assert!(resp.status().is_success());
    assert!(resp.text().await.unwrap().contains("ok"));

    // Verify Admin API (Metrics)
    let metrics_url = format!("http://127.0.0.1:{}/metrics", ADMIN_PORT);
    let metrics: serde_json::Value = reqwest::get(&metrics_url).await.unwrap().json().await.unwrap();
    assert!(metrics["total_requests"].as_u64().unwrap() > 0);
    assert!(metrics["tunnels"].as_u64().unwrap() > 0);
    // iana.org, pywb.proxy family hosts, example.com and httpbin.org each got one leaf.
    assert!(metrics["certificates_issued"].as_u64().unwrap() >= 4);
    assert_eq!(metrics["issuance_failures"].as_u64(), Some(0));
    assert_eq!(metrics["live_sessions"].as_u64(), Some(1));

    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("proxy did not stop")
        .unwrap();
    assert!(result.is_ok());
}
