//! Shared data model for the replay proxy.
//!
//! The core crate owns the behaviour; this crate only holds the plain types that travel
//! between the session store, the routing engine and the gateway backends.

pub mod session;
pub mod timestamp;

pub use session::{CollectionMode, CollectionRef, ProxySession, SessionKey};
pub use timestamp::{Timestamp, TimestampError};
