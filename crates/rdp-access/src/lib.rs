//! RDP Access - authentication, authorization and audit for the portal core
//!
//! Provides:
//! - HS256 access/refresh tokens with a pinned algorithm
//! - A session store keyed by token fingerprint, with revoke-all and sweeping
//! - A policy adapter with a bounded decision cache
//! - Bounded write-behind sinks for audit records and API timings
//! - A request guard composing all of the above over a transport-agnostic
//!   request/reply pair
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rdp_access::{MemorySessionStore, TokenConfig, TokenService};
//! use rdp_types::{PrincipalId, SystemClock};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = SystemClock::shared();
//! let sessions = Arc::new(MemorySessionStore::new(clock.clone()));
//! let tokens = TokenService::new(TokenConfig::new("a-secret-of-at-least-32-bytes!!!"), sessions, clock);
//! let pair = tokens.mint_pair(PrincipalId::new(), "ada", "designer").await?;
//! let claims = tokens.verify_access(&pair.access_token).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod audit;
pub mod error;
pub mod guard;
pub mod policy;
pub mod request;
pub mod session;
pub mod sink;
pub mod token;

pub use audit::{
    client_address, AuditFilter, AuditLog, AuditStoreError, ClassificationRules, MemoryAuditLog,
};
pub use error::{AccessError, AccessResult};
pub use guard::{
    denial_reply, token_reply, Access, Identity, RequestContext, RequestGuard, RouteMatch,
};
pub use policy::{Authorizer, Decision, Denial, PolicyEngine, PolicyError, RoleTable};
pub use request::{codes, ApiReply, Envelope, InboundRequest};
pub use session::{
    MemorySessionStore, RevocationPolicy, SessionError, SessionOrigin, SessionStore,
    SessionSweeper,
};
pub use sink::{
    AuditSink, MemoryWriter, MetricsBuffer, RecordWriter, SinkConfig, SinkStats, WriteBehind,
    WriteError,
};
pub use token::{
    fingerprint, Audience, Claims, LookupError, PrincipalLookup, TokenConfig, TokenError,
    TokenPair, TokenService,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the access core
    pub use crate::{
        Access, ApiReply, Authorizer, InboundRequest, RequestGuard, RouteMatch, SessionStore,
        TokenService,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
