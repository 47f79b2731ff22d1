//! Replay Proxy Core Library
//!
//! TLS interception and session-aware routing for browsing an archive through an HTTP(S)
//! proxy: the certificate authority and per-host leaf cache, the session store, the routing
//! engine that picks a collection and timestamp per request, and the gateway backends it
//! consults.

pub mod admin;
pub mod ca;
pub mod certificates;
pub mod handlers;
/// Core proxy functionality modules
pub mod proxy;

/// Configuration types and utilities
pub mod config;

/// Error types for proxy operations
pub mod error;

/// Archive lookups and replay content
pub mod gateway;

pub mod pages;
pub mod routing;
pub mod session_store;
pub mod target;

pub use admin::Metrics;
pub use ca::{AuthorityArtifact, CertificateAuthority};
pub use certificates::{
    AuthorityIssuer, CertificateIssuer, HostCertificate, HostCertificateCache, SelfSignedIssuer,
};
pub use config::{CertificateConfig, GatewayConfig, ProxyConfig, ProxyStartupConfig, RoutingConfig};
pub use error::{GatewayError, ProxyError};
pub use gateway::{Capture, Gateway, IndexGateway, RemoteGateway, ReplayContent};
pub use handlers::ReplayHandler;
/// Re-export commonly used types
pub use proxy::ProxyServer;
pub use routing::{RouteRequest, RoutingDecision, RoutingEngine, RoutingOutcome};
pub use session_store::SessionStore;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
