//! The routing state machine.
//!
//! Maps a request's host, path, query and session cookie to a [`RoutingDecision`]. Session
//! state is read as a snapshot and written back through [`SessionStore::update`], so no
//! session lock is ever held while the gateway is being consulted.

use crate::admin::Metrics;
use crate::ca::AuthorityArtifact;
use crate::config::{RoutingConfig, P12_DOWNLOAD_PATH, PEM_DOWNLOAD_PATH};
use crate::error::{GatewayError, ProxyError};
use crate::gateway::{distinct_timestamps, Gateway, GatewayResult, ReplayContent};
use crate::session_store::SessionStore;
use crate::target::{
    absolute_url, handoff_url, listing_url, marked_suffix, path_rest, request_url,
    selection_url, split_marker, HostKind, Marker, HANDOFF_PREFIX,
};
use crate::Result;
use replay_proxy_common::{CollectionMode, CollectionRef, ProxySession, SessionKey, Timestamp};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// One proxied request as the router sees it.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// `http` or `https`, as the client used it
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
    /// Raw value of the session cookie, if the client sent one
    pub session_cookie: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Serve the capture of `target` closest to `timestamp`
    Replay {
        collection: CollectionRef,
        timestamp: Timestamp,
        target: Url,
    },
    /// No usable session: send the client to the selection domain
    RedirectToSelection { location: String },
    /// Collection picker for the marked target `suffix`
    ServeSelectionPage {
        suffix: String,
        collections: Vec<String>,
        no_captures: bool,
        notice: Option<String>,
    },
    ServeCaptureListing {
        collection: CollectionRef,
        target: Url,
        timestamps: Vec<Timestamp>,
    },
    /// Session state changed; continue at `location`
    MutateSessionAndRedirect {
        session: SessionKey,
        mode: CollectionMode,
        sticky: Option<Timestamp>,
        location: String,
    },
    /// Handoff redeemed on a literal domain; the cookie for it goes out with this redirect
    PlantCookieAndRedirect { session: SessionKey, location: String },
    /// `/static/...`, or `/` for the landing page
    ServeStatic { asset_path: String },
    ServeAuthorityArtifact(AuthorityArtifact),
    NotFound,
}

impl RoutingDecision {
    fn label(&self) -> &'static str {
        match self {
            RoutingDecision::Replay { .. } => "replay",
            RoutingDecision::RedirectToSelection { .. } => "redirect-to-selection",
            RoutingDecision::ServeSelectionPage { .. } => "selection-page",
            RoutingDecision::ServeCaptureListing { .. } => "capture-listing",
            RoutingDecision::MutateSessionAndRedirect { .. } => "mutate-session",
            RoutingDecision::PlantCookieAndRedirect { .. } => "plant-cookie",
            RoutingDecision::ServeStatic { .. } => "static",
            RoutingDecision::ServeAuthorityArtifact(_) => "authority-artifact",
            RoutingDecision::NotFound => "not-found",
        }
    }
}

/// Session cookie to send with the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub key: SessionKey,
    /// `Domain` attribute: the root domain family or one literal host
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingOutcome {
    pub decision: RoutingDecision,
    pub cookie: Option<SessionCookie>,
}

impl From<RoutingDecision> for RoutingOutcome {
    fn from(decision: RoutingDecision) -> Self {
        Self {
            decision,
            cookie: None,
        }
    }
}

/// A session that has a collection pinned.
struct Pinned {
    session: ProxySession,
    collection: CollectionRef,
}

pub struct RoutingEngine {
    routing: RoutingConfig,
    sessions: Arc<SessionStore>,
    gateway: Arc<dyn Gateway>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl RoutingEngine {
    pub fn new(
        routing: RoutingConfig,
        sessions: Arc<SessionStore>,
        gateway: Arc<dyn Gateway>,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            routing,
            sessions,
            gateway,
            timeout,
            metrics,
        }
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.routing
    }

    pub async fn route(&self, req: &RouteRequest) -> Result<RoutingOutcome> {
        let kind = HostKind::classify(&self.routing, &req.host);
        let outcome = match &kind {
            HostKind::Root => Ok(self.route_root(req).into()),
            HostKind::Select => self.route_select(req).await,
            HostKind::Query => self.route_query(req).await,
            HostKind::Auto => self.route_auto(req).await,
            HostKind::Collection(collection) => self.route_collection(req, collection).await,
            HostKind::Literal => self.route_literal(req).await,
        }?;

        debug!(
            "{}://{}{} -> {}",
            req.scheme,
            req.host,
            req.path,
            outcome.decision.label()
        );
        self.count(&outcome.decision);
        Ok(outcome)
    }

    /// Fetch replay content, bounded by the gateway timeout.
    pub async fn render(
        &self,
        collection: &CollectionRef,
        timestamp: &Timestamp,
        target: &Url,
    ) -> Result<Option<ReplayContent>> {
        self.call(self.gateway.render(collection, timestamp, target))
            .await
    }

    /// Collection names for a selection page, bounded by the gateway timeout.
    pub async fn collections(&self) -> Result<Vec<String>> {
        self.call(self.gateway.collections()).await
    }

    fn route_root(&self, req: &RouteRequest) -> RoutingDecision {
        match req.path.as_str() {
            "" | "/" => RoutingDecision::ServeStatic {
                asset_path: "/".to_string(),
            },
            PEM_DOWNLOAD_PATH => RoutingDecision::ServeAuthorityArtifact(AuthorityArtifact::Pem),
            P12_DOWNLOAD_PATH => {
                RoutingDecision::ServeAuthorityArtifact(AuthorityArtifact::Pkcs12)
            }
            path if path.starts_with("/static/") => RoutingDecision::ServeStatic {
                asset_path: path.to_string(),
            },
            _ => RoutingDecision::NotFound,
        }
    }

    /// Terminal and side-effect free: never looks at the session.
    async fn route_select(&self, req: &RouteRequest) -> Result<RoutingOutcome> {
        let suffix = path_rest(&req.path, req.query.as_deref());
        Ok(self.selection_page(suffix, false, None).await?.into())
    }

    async fn route_query(&self, req: &RouteRequest) -> Result<RoutingOutcome> {
        let rest = path_rest(&req.path, req.query.as_deref());
        let (marker, tail) = split_marker(&rest, false);
        let Some(target) = absolute_url(tail, &req.scheme) else {
            return Ok(self.selection_page(rest.clone(), false, None).await?.into());
        };

        match self.pinned(req).await {
            None => Ok(self.bounce(req, &marker, &target).into()),
            Some(pinned) => match marker {
                Marker::Bare => self.refresh_latest(req, pinned, &target).await,
                marker => self.follow_marker(req, pinned, marker, &target).await,
            },
        }
    }

    /// With a session, `auto.` behaves like the target's own domain; without one it bounces.
    async fn route_auto(&self, req: &RouteRequest) -> Result<RoutingOutcome> {
        let rest = path_rest(&req.path, req.query.as_deref());
        let Some(pinned) = self.pinned(req).await else {
            return Ok(self.redirect_to_selection(&req.scheme, &rest).into());
        };
        let (marker, tail) = split_marker(&rest, false);
        let Some(target) = absolute_url(tail, &req.scheme) else {
            return Ok(self.selection_page(rest.clone(), false, None).await?.into());
        };

        match marker {
            Marker::Bare => {
                let sticky = match pinned.session.sticky_for(&pinned.collection) {
                    Some(ts) => ts.clone(),
                    None => match self.resolve_latest(&pinned.collection, &target).await? {
                        Some(ts) => ts,
                        None => return self.no_captures(target.as_str()).await,
                    },
                };
                self.commit(req, &pinned.session.key, pinned.collection, Some(sticky), &target, false)
                    .await
            }
            marker => self.follow_marker(req, pinned, marker, &target).await,
        }
    }

    async fn route_collection(
        &self,
        req: &RouteRequest,
        collection: &CollectionRef,
    ) -> Result<RoutingOutcome> {
        let rest = path_rest(&req.path, req.query.as_deref());
        if let CollectionRef::Named(name) = collection {
            if !self.call(self.gateway.has_collection(name)).await? {
                let notice = format!("Unknown collection \"{}\"", name);
                return Ok(self.selection_page(rest, false, Some(notice)).await?.into());
            }
        }

        let (marker, tail) = split_marker(&rest, false);
        let target = absolute_url(tail, &req.scheme);
        let existing = self.session(req).await;
        let known_sticky = existing
            .as_ref()
            .and_then(|s| s.sticky_for(collection).cloned());

        let (sticky, location_target) = match (&marker, target) {
            (_, None) => {
                let landing = format!("{}://{}/", req.scheme, self.routing.root_domain);
                (None, landing)
            }
            (Marker::Bare, Some(target)) if self.is_magic_url(&target) => {
                (None, target.to_string())
            }
            (Marker::Listing, Some(target)) => {
                (None, listing_url(&self.routing, &req.scheme, &target))
            }
            (Marker::Timestamp(ts), Some(target)) => (Some(ts.clone()), target.to_string()),
            (Marker::Bare, Some(target)) => {
                let sticky = match known_sticky {
                    Some(ts) => ts,
                    None => match self.resolve_latest(collection, &target).await? {
                        Some(ts) => ts,
                        None => return self.no_captures(target.as_str()).await,
                    },
                };
                (Some(sticky), target.to_string())
            }
        };

        let key = match existing {
            Some(session) => session.key,
            None => match req.session_cookie.as_deref().and_then(SessionKey::parse) {
                Some(key) => self.sessions.get_or_create(key).await.key,
                None => self.sessions.create(),
            },
        };

        // Replay targets land on a literal host that may still need the cookie planted.
        match Url::parse(&location_target) {
            Ok(target) if !self.is_magic_url(&target) => {
                let overwrite = matches!(marker, Marker::Timestamp(_));
                self.commit(req, &key, collection.clone(), sticky, &target, overwrite)
                    .await
            }
            _ => {
                let session = self
                    .sessions
                    .update(&key, |s| {
                        s.pin(collection.clone());
                        s.clone()
                    })
                    .await;
                info!(
                    "Session {} pinned to {}",
                    key.short(),
                    collection
                );
                Ok(RoutingOutcome {
                    decision: RoutingDecision::MutateSessionAndRedirect {
                        session: key.clone(),
                        mode: session.map(|s| s.mode).unwrap_or_default(),
                        sticky: None,
                        location: location_target,
                    },
                    cookie: Some(self.family_cookie(&key)),
                })
            }
        }
    }

    async fn route_literal(&self, req: &RouteRequest) -> Result<RoutingOutcome> {
        if let Some(token) = req.path.strip_prefix(HANDOFF_PREFIX) {
            return Ok(self.redeem(req, token).await);
        }

        let rest = path_rest(&req.path, req.query.as_deref());
        let (marker, tail) = split_marker(&rest, true);
        let target = match marker {
            Marker::Bare => request_url(
                &req.scheme,
                &req.host,
                req.port,
                &req.path,
                req.query.as_deref(),
            ),
            _ => absolute_url(tail, &req.scheme),
        };
        let Some(target) = target else {
            return Ok(RoutingDecision::NotFound.into());
        };

        let Some(pinned) = self.pinned(req).await else {
            return Ok(self.bounce(req, &marker, &target).into());
        };
        if marker != Marker::Bare {
            return self.follow_marker(req, pinned, marker, &target).await;
        }

        // Ordinary browsing stays on the sticky timestamp; it is only resolved here when the
        // collection was pinned without one.
        let Pinned {
            session,
            collection,
        } = pinned;
        let timestamp = match session.sticky_for(&collection) {
            Some(ts) => ts.clone(),
            None => {
                let Some(ts) = self.resolve_latest(&collection, &target).await? else {
                    return self.no_captures(target.as_str()).await;
                };
                let (c, t) = (collection.clone(), ts.clone());
                self.sessions
                    .update(&session.key, move |s| {
                        if s.sticky_for(&c).is_none() {
                            s.set_sticky(&c, t);
                        }
                    })
                    .await;
                ts
            }
        };

        let host = target.host_str().unwrap_or(&req.host).to_string();
        let cookie = if session.is_planted(&host) {
            None
        } else {
            self.sessions
                .update(&session.key, |s| s.mark_planted(&host))
                .await;
            Some(SessionCookie {
                key: session.key.clone(),
                domain: host,
            })
        };

        Ok(RoutingOutcome {
            decision: RoutingDecision::Replay {
                collection,
                timestamp,
                target,
            },
            cookie,
        })
    }

    /// `*` and timestamp markers for a client with a pinned collection.
    async fn follow_marker(
        &self,
        req: &RouteRequest,
        pinned: Pinned,
        marker: Marker,
        target: &Url,
    ) -> Result<RoutingOutcome> {
        match marker {
            Marker::Listing => {
                let captures = self
                    .call(self.gateway.list_captures(&pinned.collection, target))
                    .await?;
                Ok(RoutingDecision::ServeCaptureListing {
                    collection: pinned.collection,
                    target: target.clone(),
                    timestamps: distinct_timestamps(&captures),
                }
                .into())
            }
            Marker::Timestamp(ts) => {
                self.commit(req, &pinned.session.key, pinned.collection, Some(ts), target, true)
                    .await
            }
            Marker::Bare => self.refresh_latest(req, pinned, target).await,
        }
    }

    /// Bare query-domain visit: resolve "latest" again even when a sticky value exists.
    async fn refresh_latest(
        &self,
        req: &RouteRequest,
        pinned: Pinned,
        target: &Url,
    ) -> Result<RoutingOutcome> {
        match self.resolve_latest(&pinned.collection, target).await? {
            Some(ts) => {
                self.commit(req, &pinned.session.key, pinned.collection, Some(ts), target, true)
                    .await
            }
            None => self.no_captures(target.as_str()).await,
        }
    }

    /// Pin `collection` and record `sticky`, then send the client to the bare `target` through a
    /// cookie handoff on the target host.
    ///
    /// Without `overwrite`, an existing sticky timestamp for the collection wins.
    async fn commit(
        &self,
        req: &RouteRequest,
        key: &SessionKey,
        collection: CollectionRef,
        sticky: Option<Timestamp>,
        target: &Url,
        overwrite: bool,
    ) -> Result<RoutingOutcome> {
        let pinned_to = collection.clone();
        let updated = self
            .sessions
            .update(key, move |s| {
                s.pin(collection.clone());
                if let Some(ts) = sticky {
                    if overwrite || s.sticky_for(&collection).is_none() {
                        s.set_sticky(&collection, ts);
                    }
                }
                s.clone()
            })
            .await;
        let Some(session) = updated else {
            // Only reachable if the session vanished between lookup and update.
            return Ok(self.redirect_to_selection(&req.scheme, target.as_str()).into());
        };

        // A magic host cannot see the literal host's cookies, so the cookie is re-planted on
        // every commit even when the session already recorded it.
        let location = handoff_url(target, &self.sessions.issue_handoff(key, target));
        let sticky = session.sticky_timestamp().cloned();
        info!(
            "Session {} pinned to {} at {}",
            key.short(),
            pinned_to,
            sticky.as_ref().map(|t| t.as_str()).unwrap_or("latest")
        );

        Ok(RoutingOutcome {
            decision: RoutingDecision::MutateSessionAndRedirect {
                session: key.clone(),
                mode: session.mode.clone(),
                sticky,
                location,
            },
            cookie: Some(self.family_cookie(key)),
        })
    }

    async fn redeem(&self, req: &RouteRequest, token: &str) -> RoutingOutcome {
        let fallback = format!("{}://{}/", req.scheme, req.host);
        let Some((key, target)) = self.sessions.redeem_handoff(token, &req.host) else {
            return self.redirect_to_selection(&req.scheme, &fallback).into();
        };
        let host = target.host_str().unwrap_or(&req.host).to_string();
        if self
            .sessions
            .update(&key, |s| s.mark_planted(&host))
            .await
            .is_none()
        {
            return self.redirect_to_selection(&req.scheme, target.as_str()).into();
        }

        debug!("Planted session {} on {}", key.short(), host);
        RoutingOutcome {
            decision: RoutingDecision::PlantCookieAndRedirect {
                session: key.clone(),
                location: target.to_string(),
            },
            cookie: Some(SessionCookie { key, domain: host }),
        }
    }

    /// Session-less client: back to selection with the marked target intact.
    fn bounce(&self, req: &RouteRequest, marker: &Marker, target: &Url) -> RoutingDecision {
        let suffix = match marker {
            Marker::Listing => listing_url(&self.routing, &req.scheme, target),
            marker => marked_suffix(marker, target.as_str()),
        };
        self.redirect_to_selection(&req.scheme, &suffix)
    }

    fn redirect_to_selection(&self, scheme: &str, suffix: &str) -> RoutingDecision {
        RoutingDecision::RedirectToSelection {
            location: selection_url(&self.routing, scheme, suffix),
        }
    }

    async fn selection_page(
        &self,
        suffix: String,
        no_captures: bool,
        notice: Option<String>,
    ) -> Result<RoutingDecision> {
        let collections = self.collections().await?;
        Ok(RoutingDecision::ServeSelectionPage {
            suffix,
            collections,
            no_captures,
            notice,
        })
    }

    async fn no_captures(&self, suffix: &str) -> Result<RoutingOutcome> {
        Ok(self
            .selection_page(suffix.to_string(), true, None)
            .await?
            .into())
    }

    async fn resolve_latest(
        &self,
        collection: &CollectionRef,
        target: &Url,
    ) -> Result<Option<Timestamp>> {
        let now = Timestamp::now();
        self.call(self.gateway.closest_capture(collection, target, &now))
            .await
    }

    async fn session(&self, req: &RouteRequest) -> Option<ProxySession> {
        let key = SessionKey::parse(req.session_cookie.as_deref()?)?;
        self.sessions.get(&key).await
    }

    /// The client's session, if it has one with a collection pinned.
    async fn pinned(&self, req: &RouteRequest) -> Option<Pinned> {
        let session = self.session(req).await?;
        let collection = session.collection()?;
        Some(Pinned {
            session,
            collection,
        })
    }

    fn is_magic_url(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| self.routing.is_magic_host(host))
            .unwrap_or(false)
    }

    fn family_cookie(&self, key: &SessionKey) -> SessionCookie {
        SessionCookie {
            key: key.clone(),
            domain: self.routing.root_domain.clone(),
        }
    }

    async fn call<T>(&self, lookup: impl Future<Output = GatewayResult<T>>) -> Result<T> {
        let result = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Unavailable(format!(
                "no answer within {:?}",
                self.timeout
            ))),
        };
        result.map_err(|e| {
            self.metrics.gateway_errors.fetch_add(1, Ordering::Relaxed);
            ProxyError::from(e)
        })
    }

    fn count(&self, decision: &RoutingDecision) {
        let counter = match decision {
            RoutingDecision::Replay { .. } => &self.metrics.replays,
            RoutingDecision::RedirectToSelection { .. } => &self.metrics.selection_redirects,
            RoutingDecision::ServeCaptureListing { .. } => &self.metrics.listings,
            RoutingDecision::MutateSessionAndRedirect { .. }
            | RoutingDecision::PlantCookieAndRedirect { .. } => &self.metrics.session_mutations,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
