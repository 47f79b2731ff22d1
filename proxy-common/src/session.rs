//! Per-client routing state shared by every intercepted domain a browser visits.
//!
//! A session is addressed only by its opaque key. The domain a cookie arrives on never takes
//! part in lookup; it only matters for deciding where the cookie still has to be planted.

use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Opaque, unguessable session token carried in the session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accepts only the shape produced by [`SessionKey::generate`].
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed = raw.len() == 32
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix that is safe to put in logs.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which captures a lookup runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionRef {
    Named(String),
    All,
}

impl CollectionRef {
    fn sticky_key(&self) -> String {
        match self {
            CollectionRef::Named(name) => name.clone(),
            // Not a legal hostname label, so it never collides with a collection name.
            CollectionRef::All => "*".to_string(),
        }
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionRef::Named(name) => f.write_str(name),
            CollectionRef::All => f.write_str("all collections"),
        }
    }
}

/// Collection choice pinned by a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CollectionMode {
    #[default]
    Unset,
    Fixed(String),
    Aggregate,
}

impl CollectionMode {
    pub fn collection(&self) -> Option<CollectionRef> {
        match self {
            CollectionMode::Unset => None,
            CollectionMode::Fixed(name) => Some(CollectionRef::Named(name.clone())),
            CollectionMode::Aggregate => Some(CollectionRef::All),
        }
    }
}

impl From<CollectionRef> for CollectionMode {
    fn from(value: CollectionRef) -> Self {
        match value {
            CollectionRef::Named(name) => CollectionMode::Fixed(name),
            CollectionRef::All => CollectionMode::Aggregate,
        }
    }
}

/// Mutable routing state behind one session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySession {
    pub key: SessionKey,

    pub mode: CollectionMode,

    /// Sticky timestamp per collection mode, so switching back to a collection resumes where
    /// the client left it.
    sticky: BTreeMap<String, Timestamp>,

    /// Literal domains that have already been sent the session cookie.
    planted_domains: BTreeSet<String>,

    pub created_at: chrono::DateTime<chrono::Utc>,

    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ProxySession {
    pub fn new(key: SessionKey) -> Self {
        let now = chrono::Utc::now();
        Self {
            key,
            mode: CollectionMode::Unset,
            sticky: BTreeMap::new(),
            planted_domains: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn collection(&self) -> Option<CollectionRef> {
        self.mode.collection()
    }

    /// Pin a collection. The sticky timestamp already recorded for it, if any, is kept.
    pub fn pin(&mut self, collection: CollectionRef) {
        self.mode = collection.into();
        self.touch();
    }

    /// Sticky timestamp of the pinned collection.
    pub fn sticky_timestamp(&self) -> Option<&Timestamp> {
        self.collection().and_then(|c| self.sticky_for(&c))
    }

    pub fn sticky_for(&self, collection: &CollectionRef) -> Option<&Timestamp> {
        self.sticky.get(&collection.sticky_key())
    }

    pub fn set_sticky(&mut self, collection: &CollectionRef, timestamp: Timestamp) {
        self.sticky.insert(collection.sticky_key(), timestamp);
        self.touch();
    }

    pub fn is_planted(&self, domain: &str) -> bool {
        self.planted_domains.contains(&domain.to_ascii_lowercase())
    }

    /// Returns `true` when the domain had not been planted before.
    pub fn mark_planted(&mut self, domain: &str) -> bool {
        let inserted = self.planted_domains.insert(domain.to_ascii_lowercase());
        if inserted {
            self.touch();
        }
        inserted
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}
