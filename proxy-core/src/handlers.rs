use crate::admin::Metrics;
use crate::ca::CertificateAuthority;
use crate::error::ProxyError;
use crate::gateway::ReplayContent;
use crate::pages;
use crate::routing::{RouteRequest, RoutingDecision, RoutingEngine, RoutingOutcome, SessionCookie};
use cookie::Cookie;
use hudsucker::{
    hyper::{
        header::{self, HeaderName, HeaderValue},
        Body, Method, Request, Response, StatusCode,
    },
    HttpContext, HttpHandler, RequestOrResponse,
};
use std::sync::{atomic::Ordering, Arc};
use tracing::{debug, warn};

/// Answers every decrypted or plain request from the routing engine.
///
/// `CONNECT` requests are passed back to hudsucker untouched so that it opens the tunnel and
/// intercepts TLS with a leaf from the host certificate cache.
#[derive(Clone)]
pub struct ReplayHandler {
    engine: Arc<RoutingEngine>,
    authority: Arc<CertificateAuthority>,
    metrics: Arc<Metrics>,
}

impl ReplayHandler {
    pub fn new(
        engine: Arc<RoutingEngine>,
        authority: Arc<CertificateAuthority>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            engine,
            authority,
            metrics,
        }
    }

    /// Route one request and build its response.
    pub async fn serve(&self, req: Request<Body>) -> Response<Body> {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        let Some(route_req) = route_request(&req, &self.engine.routing().cookie_name) else {
            return Reply::html(
                StatusCode::BAD_REQUEST,
                pages::bad_request_page("The request names no host to replay."),
            )
            .into_response();
        };
        debug!("{} {}", req.method(), req.uri());

        match self.engine.route(&route_req).await {
            Ok(outcome) => self.respond(&route_req, outcome).await,
            Err(e) => unavailable(&route_req, e),
        }
    }

    async fn respond(&self, req: &RouteRequest, outcome: RoutingOutcome) -> Response<Body> {
        let routing = self.engine.routing();
        let reply = match outcome.decision {
            RoutingDecision::Replay {
                collection,
                timestamp,
                target,
            } => match self.engine.render(&collection, &timestamp, &target).await {
                Ok(Some(content)) => Reply::replay(content),
                // Nothing archived here: offer the other collections instead.
                Ok(None) => match self.engine.collections().await {
                    Ok(collections) => Reply::html(
                        StatusCode::OK,
                        pages::selection_page(
                            routing,
                            &req.scheme,
                            target.as_str(),
                            &collections,
                            true,
                            None,
                        ),
                    ),
                    Err(e) => return unavailable(req, e),
                },
                Err(e) => return unavailable(req, e),
            },
            RoutingDecision::RedirectToSelection { location }
            | RoutingDecision::MutateSessionAndRedirect { location, .. }
            | RoutingDecision::PlantCookieAndRedirect { location, .. } => Reply::redirect(&location),
            RoutingDecision::ServeSelectionPage {
                suffix,
                collections,
                no_captures,
                notice,
            } => Reply::html(
                StatusCode::OK,
                pages::selection_page(
                    routing,
                    &req.scheme,
                    &suffix,
                    &collections,
                    no_captures,
                    notice.as_deref(),
                ),
            ),
            RoutingDecision::ServeCaptureListing {
                collection,
                target,
                timestamps,
            } => Reply::html(
                StatusCode::OK,
                pages::listing_page(routing, &req.scheme, &collection, &target, &timestamps),
            ),
            RoutingDecision::ServeStatic { asset_path } if asset_path == "/" => {
                Reply::html(StatusCode::OK, pages::landing_page(routing))
            }
            RoutingDecision::ServeStatic { asset_path } => {
                match pages::static_asset(routing.static_dir.as_deref(), &asset_path).await {
                    Some(asset) => Reply::new(StatusCode::OK, &asset.content_type, asset.body),
                    None => Reply::html(StatusCode::NOT_FOUND, pages::not_found_page(&asset_path)),
                }
            }
            RoutingDecision::ServeAuthorityArtifact(artifact) => Reply::new(
                StatusCode::OK,
                artifact.content_type(),
                self.authority.artifact(artifact).to_vec(),
            ),
            RoutingDecision::NotFound => {
                Reply::html(StatusCode::NOT_FOUND, pages::not_found_page(&req.path))
            }
        };

        match outcome.cookie {
            Some(cookie) => reply
                .with_header(header::SET_COOKIE, session_cookie(&routing.cookie_name, &cookie))
                .into_response(),
            None => reply.into_response(),
        }
    }
}

#[async_trait::async_trait]
impl HttpHandler for ReplayHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            self.metrics.tunnels.fetch_add(1, Ordering::Relaxed);
            return RequestOrResponse::Request(req);
        }
        RequestOrResponse::Response(self.serve(req).await)
    }
}

/// Pull the routing inputs out of a proxied request.
///
/// Intercepted requests carry an absolute URI; a `Host` header is used when they do not.
pub fn route_request(req: &Request<Body>, cookie_name: &str) -> Option<RouteRequest> {
    let uri = req.uri();
    let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();

    let (host, port) = match uri.host() {
        Some(host) => (host.to_string(), uri.port_u16()),
        None => {
            let raw = req.headers().get(header::HOST)?.to_str().ok()?;
            let authority: hudsucker::hyper::http::uri::Authority = raw.parse().ok()?;
            (authority.host().to_string(), authority.port_u16())
        }
    };
    let default_port = if scheme == "https" { 443 } else { 80 };

    Some(RouteRequest {
        scheme,
        host: host.to_ascii_lowercase(),
        port: port.filter(|p| *p != default_port),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        session_cookie: session_from_headers(req, cookie_name),
    })
}

fn session_from_headers(req: &Request<Body>, cookie_name: &str) -> Option<String> {
    req.headers()
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(|parsed| parsed.ok())
        .find(|c| c.name() == cookie_name)
        .map(|c| c.value().to_string())
}

fn session_cookie(name: &str, cookie: &SessionCookie) -> String {
    Cookie::build((name, cookie.key.as_str()))
        .domain(cookie.domain.as_str())
        .path("/")
        .http_only(true)
        .build()
        .to_string()
}

fn unavailable(req: &RouteRequest, e: ProxyError) -> Response<Body> {
    warn!("{}://{}{}: {}", req.scheme, req.host, req.path, e);
    Reply::html(
        StatusCode::SERVICE_UNAVAILABLE,
        pages::unavailable_page(&e.to_string()),
    )
    .with_header(header::RETRY_AFTER, "5".to_string())
    .into_response()
}

/// Response under construction. Every reply carries a `Content-Length`.
struct Reply {
    status: StatusCode,
    content_type: String,
    body: Vec<u8>,
    headers: Vec<(HeaderName, String)>,
}

impl Reply {
    fn new(status: StatusCode, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            body,
            headers: Vec::new(),
        }
    }

    fn html(status: StatusCode, html: String) -> Self {
        Self::new(status, "text/html; charset=utf-8", html.into_bytes())
    }

    fn redirect(location: &str) -> Self {
        Self::html(
            StatusCode::SEE_OTHER,
            format!("<a href=\"{}\">See Other</a>\n", location.replace('"', "%22")),
        )
        .with_header(header::LOCATION, location.to_string())
    }

    /// An archived 3xx keeps its status only when it still knows where it pointed.
    fn replay(content: ReplayContent) -> Self {
        let status = match StatusCode::from_u16(content.status) {
            Ok(status) if status.is_redirection() && content.location.is_none() => StatusCode::OK,
            Ok(status) => status,
            Err(_) => StatusCode::OK,
        };
        let memento = content
            .timestamp
            .to_datetime()
            .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string());

        let mut reply = Self::new(status, &content.content_type, content.body);
        if let Some(value) = memento {
            reply = reply.with_header(HeaderName::from_static("memento-datetime"), value);
        }
        match content.location {
            Some(location) if status.is_redirection() => {
                reply.with_header(header::LOCATION, location)
            }
            _ => reply,
        }
    }

    fn with_header(mut self, name: HeaderName, value: String) -> Self {
        self.headers.push((name, value));
        self
    }

    fn into_response(self) -> Response<Body> {
        let length = self.body.len();
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&self.content_type)
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        for (name, value) in self.headers {
            match HeaderValue::from_str(&value) {
                Ok(value) => {
                    headers.append(name, value);
                }
                Err(_) => warn!("Dropping unencodable {} header", name),
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::error::GatewayError;
    use crate::gateway::{Capture, Gateway, GatewayResult, IndexGateway};
    use crate::session_store::SessionStore;
    use async_trait::async_trait;
    use hudsucker::hyper::body::to_bytes;
    use replay_proxy_common::{CollectionRef, Timestamp};
    use std::time::Duration;
    use url::Url;

    const INDEX: &str = include_str!("../tests/fixtures/archive-index.json");

    struct Fixture {
        handler: ReplayHandler,
        _ca_dir: tempfile::TempDir,
    }

    fn fixture_with(gateway: Arc<dyn Gateway>) -> Fixture {
        let ca_dir = tempfile::tempdir().unwrap();
        let authority = Arc::new(CertificateAuthority::new(ca_dir.path()).unwrap());
        let metrics = Arc::new(Metrics::default());
        let engine = RoutingEngine::new(
            RoutingConfig::with_root_domain("pywb.proxy"),
            Arc::new(SessionStore::new(Arc::clone(&metrics))),
            gateway,
            Duration::from_secs(5),
            Arc::clone(&metrics),
        );
        Fixture {
            handler: ReplayHandler::new(Arc::new(engine), authority, metrics),
            _ca_dir: ca_dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(IndexGateway::from_json(INDEX).unwrap()))
    }

    fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn header_str<'a>(res: &'a Response<Body>, name: HeaderName) -> &'a str {
        res.headers().get(name).unwrap().to_str().unwrap()
    }

    async fn body_text(res: Response<Body>) -> String {
        let bytes = to_bytes(res.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_route_request_from_absolute_uri() {
        let req = get(
            "https://iana.org:443/path?x=1",
            Some("other=1; __replay_proxy_sesh=abc"),
        );
        let route = route_request(&req, "__replay_proxy_sesh").unwrap();
        assert_eq!(route.scheme, "https");
        assert_eq!(route.host, "iana.org");
        assert_eq!(route.port, None);
        assert_eq!(route.path, "/path");
        assert_eq!(route.query.as_deref(), Some("x=1"));
        assert_eq!(route.session_cookie.as_deref(), Some("abc"));
    }

    #[test]
    fn test_route_request_from_host_header() {
        let req = Request::builder()
            .uri("/static/replay.js")
            .header(header::HOST, "pywb.proxy:8080")
            .body(Body::empty())
            .unwrap();
        let route = route_request(&req, "__replay_proxy_sesh").unwrap();
        assert_eq!(route.scheme, "http");
        assert_eq!(route.host, "pywb.proxy");
        assert_eq!(route.port, Some(8080));
        assert!(route.session_cookie.is_none());
    }

    #[tokio::test]
    async fn test_authority_downloads() {
        let f = fixture();
        let pem = f.handler.serve(get("http://pywb.proxy/replay-proxy-ca.pem", None)).await;
        assert_eq!(pem.status(), StatusCode::OK);
        assert_eq!(header_str(&pem, header::CONTENT_TYPE), "application/x-x509-ca-cert");
        assert!(body_text(pem).await.starts_with("-----BEGIN CERTIFICATE-----"));

        let p12 = f.handler.serve(get("https://pywb.proxy/replay-proxy-ca.p12", None)).await;
        assert_eq!(header_str(&p12, header::CONTENT_TYPE), "application/x-pkcs12");
        let length: usize = header_str(&p12, header::CONTENT_LENGTH).parse().unwrap();
        assert_eq!(length, f.handler.authority.pkcs12_der().len());
    }

    #[tokio::test]
    async fn test_landing_and_static() {
        let f = fixture();
        let landing = f.handler.serve(get("http://pywb.proxy/", None)).await;
        assert!(header_str(&landing, header::CONTENT_TYPE).starts_with("text/html"));
        assert!(body_text(landing).await.contains("Download"));

        let js = f.handler.serve(get("http://pywb.proxy/static/replay.js", None)).await;
        assert_eq!(js.status(), StatusCode::OK);
        assert!(body_text(js).await.contains("function init_banner"));

        let missing = f.handler.serve(get("http://pywb.proxy/static/nope.js", None)).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pin_sets_family_cookie_and_redirects() {
        let f = fixture();
        let res = f
            .handler
            .serve(get("https://older-set.pywb.proxy/https://iana.org/", None))
            .await;
        assert_eq!(res.status(), StatusCode::SEE_OTHER);
        assert!(header_str(&res, header::LOCATION)
            .starts_with("https://iana.org/__replay_proxy_sesh__/"));

        let set_cookie = header_str(&res, header::SET_COOKIE);
        assert!(set_cookie.starts_with("__replay_proxy_sesh="));
        assert!(set_cookie.contains("Domain=pywb.proxy"));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Path=/"));
        assert!(res.headers().contains_key(header::CONTENT_LENGTH));
    }

    #[tokio::test]
    async fn test_replay_after_handoff() {
        let f = fixture();
        let pin = f
            .handler
            .serve(get("https://older-set.pywb.proxy/https://iana.org/", None))
            .await;
        let handoff = header_str(&pin, header::LOCATION).to_string();

        let planted = f.handler.serve(get(&handoff, None)).await;
        assert_eq!(header_str(&planted, header::LOCATION), "https://iana.org/");
        let set_cookie = header_str(&planted, header::SET_COOKIE).to_string();
        assert!(set_cookie.contains("Domain=iana.org"));

        let pair = set_cookie.split(';').next().unwrap().to_string();
        let replay = f.handler.serve(get("https://iana.org/", Some(&pair))).await;
        assert_eq!(replay.status(), StatusCode::OK);
        assert_eq!(
            header_str(&replay, HeaderName::from_static("memento-datetime")),
            "Sun, 26 Jan 2014 20:06:24 GMT"
        );
        assert!(replay.headers().get(header::SET_COOKIE).is_none());
        assert!(body_text(replay).await.contains("20140126200624"));
    }

    #[tokio::test]
    async fn test_no_session_redirects_to_selection() {
        let f = fixture();
        let res = f.handler.serve(get("https://iana.org/", None)).await;
        assert_eq!(res.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            header_str(&res, header::LOCATION),
            "https://select.pywb.proxy/https://iana.org/"
        );

        let select = f
            .handler
            .serve(get("https://select.pywb.proxy/https://iana.org/", None))
            .await;
        assert_eq!(select.status(), StatusCode::OK);
        assert!(body_text(select)
            .await
            .contains("https://older-set.pywb.proxy/https://iana.org/"));
    }

    /// Pin through `pin_url`, redeem the handoff and return the planted `name=value` pair.
    async fn planted_cookie(f: &Fixture, pin_url: &str) -> String {
        let pin = f.handler.serve(get(pin_url, None)).await;
        let handoff = header_str(&pin, header::LOCATION).to_string();
        let planted = f.handler.serve(get(&handoff, None)).await;
        let set_cookie = header_str(&planted, header::SET_COOKIE);
        set_cookie.split(';').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_missing_capture_offers_other_collections() {
        let f = fixture();
        let cookie = planted_cookie(&f, "https://older-set.pywb.proxy/https://iana.org/").await;

        let res = f
            .handler
            .serve(get("https://iana.org/never-archived", Some(&cookie)))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().contains_key(header::CONTENT_LENGTH));
        let body = body_text(res).await;
        assert!(body.contains("https://all-set.pywb.proxy/https://iana.org/never-archived"));
        assert!(body.contains("https://older-set.pywb.proxy/https://iana.org/never-archived"));
    }

    #[tokio::test]
    async fn test_archived_redirects() {
        let index = r#"{ "collections": { "web": [
            { "url": "http://iana.org/about", "timestamp": "20140126200624",
              "status": 301, "location": "http://www.iana.org/about" },
            { "url": "http://iana.org/moved", "timestamp": "20140126200624", "status": 302 }
        ] } }"#;
        let f = fixture_with(Arc::new(IndexGateway::from_json(index).unwrap()));
        let cookie = planted_cookie(&f, "https://web.pywb.proxy/https://iana.org/about").await;

        let res = f.handler.serve(get("https://iana.org/about", Some(&cookie))).await;
        assert_eq!(res.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(header_str(&res, header::LOCATION), "http://www.iana.org/about");

        // Without a target the redirect cannot be followed, so it is served as a page.
        let res = f.handler.serve(get("https://iana.org/moved", Some(&cookie))).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().get(header::LOCATION).is_none());
    }

    #[tokio::test]
    async fn test_request_without_host_is_bad_request() {
        let f = fixture();
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let res = f.handler.serve(req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(res).await.contains("Bad request"));
    }

    struct DownGateway;

    #[async_trait]
    impl Gateway for DownGateway {
        async fn has_collection(&self, _name: &str) -> GatewayResult<bool> {
            Err(GatewayError::Unavailable("connection refused".to_string()))
        }

        async fn collections(&self) -> GatewayResult<Vec<String>> {
            Err(GatewayError::Unavailable("connection refused".to_string()))
        }

        async fn list_captures(
            &self,
            _collection: &CollectionRef,
            _url: &Url,
        ) -> GatewayResult<Vec<Capture>> {
            Err(GatewayError::Unavailable("connection refused".to_string()))
        }

        async fn render(
            &self,
            _collection: &CollectionRef,
            _timestamp: &Timestamp,
            _url: &Url,
        ) -> GatewayResult<Option<ReplayContent>> {
            Err(GatewayError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_gateway_outage_is_503() {
        let f = fixture_with(Arc::new(DownGateway));
        let res = f
            .handler
            .serve(get("https://older-set.pywb.proxy/https://iana.org/", None))
            .await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(header_str(&res, header::RETRY_AFTER), "5");
        assert!(res.headers().contains_key(header::CONTENT_LENGTH));
    }
}
