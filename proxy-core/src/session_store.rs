//! In-memory session store and the one-hop cookie handoff tokens.

use crate::admin::Metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use replay_proxy_common::{ProxySession, SessionKey};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

/// How long a handoff token stays redeemable.
pub const HANDOFF_TTL: Duration = Duration::from_secs(60);

type SessionSlot = Arc<Mutex<ProxySession>>;

struct PendingHandoff {
    key: SessionKey,
    target: Url,
    issued: Instant,
}

/// Sessions keyed by their opaque key.
///
/// Each session sits behind its own async mutex, so updates to one session are serialized
/// while different sessions never contend. The map itself is only touched long enough to
/// clone a slot out of it.
pub struct SessionStore {
    sessions: DashMap<SessionKey, SessionSlot>,
    handoffs: DashMap<String, PendingHandoff>,
    handoff_ttl: Duration,
    metrics: Arc<Metrics>,
}

impl SessionStore {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self::with_handoff_ttl(metrics, HANDOFF_TTL)
    }

    pub fn with_handoff_ttl(metrics: Arc<Metrics>, handoff_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            handoffs: DashMap::new(),
            handoff_ttl,
            metrics,
        }
    }

    /// Create an empty session under a fresh key.
    pub fn create(&self) -> SessionKey {
        let key = SessionKey::generate();
        self.get_or_insert(key.clone());
        info!("Created session {}", key.short());
        key
    }

    /// Snapshot of a session, `None` when the key is unknown.
    pub async fn get(&self, key: &SessionKey) -> Option<ProxySession> {
        let slot = self.slot(key)?;
        let session = slot.lock().await;
        Some(session.clone())
    }

    /// Apply `mutation` under the session's lock. `None` when the key is unknown.
    pub async fn update<F, R>(&self, key: &SessionKey, mutation: F) -> Option<R>
    where
        F: FnOnce(&mut ProxySession) -> R,
    {
        let slot = self.slot(key)?;
        let mut session = slot.lock().await;
        Some(mutation(&mut session))
    }

    /// Look up `key`, registering an empty session under it if nobody has yet.
    ///
    /// Concurrent callers with the same unseen key all end up with the one session the first
    /// of them inserted.
    pub async fn get_or_create(&self, key: SessionKey) -> ProxySession {
        let slot = self.get_or_insert(key);
        let session = slot.lock().await;
        session.clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Bind a single-use token to `key` for planting the cookie on `target`'s host.
    pub fn issue_handoff(&self, key: &SessionKey, target: &Url) -> String {
        let ttl = self.handoff_ttl;
        self.handoffs.retain(|_, pending| pending.issued.elapsed() < ttl);

        let token = Uuid::new_v4().simple().to_string();
        self.handoffs.insert(
            token.clone(),
            PendingHandoff {
                key: key.clone(),
                target: target.clone(),
                issued: Instant::now(),
            },
        );
        debug!(
            "Issued cookie handoff for session {} to {}",
            key.short(),
            target.host_str().unwrap_or_default()
        );
        token
    }

    /// Consume a handoff token presented on `host`.
    ///
    /// The token is gone after this call whatever the outcome. Expired tokens and tokens
    /// presented on a host other than the one they were issued for yield `None`.
    pub fn redeem_handoff(&self, token: &str, host: &str) -> Option<(SessionKey, Url)> {
        let (_, pending) = self.handoffs.remove(token)?;
        if pending.issued.elapsed() >= self.handoff_ttl {
            debug!("Handoff for session {} expired", pending.key.short());
            return None;
        }
        let bound_host = pending.target.host_str()?;
        if !bound_host.eq_ignore_ascii_case(host.trim_end_matches('.')) {
            debug!(
                "Handoff for {} presented on {}, refusing",
                bound_host, host
            );
            return None;
        }
        Some((pending.key, pending.target))
    }

    fn slot(&self, key: &SessionKey) -> Option<SessionSlot> {
        self.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn get_or_insert(&self, key: SessionKey) -> SessionSlot {
        match self.sessions.entry(key) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let slot = Arc::new(Mutex::new(ProxySession::new(entry.key().clone())));
                entry.insert(Arc::clone(&slot));
                self.metrics.live_sessions.fetch_add(1, Ordering::Relaxed);
                slot
            }
        }
    }
}
