//! Testing utilities for the RDP workspace
//!
//! A seeded portal on a manual clock, one principal per built-in role, and
//! request helpers that attach bearer tokens.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use rdp_access::{InboundRequest, TokenPair};
use rdp_kernel::config::SinkSection;
use rdp_kernel::{Portal, PortalBuilder, PortalConfig};
use rdp_types::{roles, ManualClock, Principal, SharedClock};

pub use rdp_kernel::{Fault, FaultyWriter};

/// HS256 secret used by every fixture
pub const TEST_SECRET: &str = "rdp-test-secret-0123456789abcdef0123456789";

/// Password given to every seeded principal
pub const PASSWORD: &str = "correct horse battery staple";

/// Short sink timeouts so shutdown in tests stays quick
pub fn test_config() -> PortalConfig {
    let sink = SinkSection {
        capacity: 1000,
        write_timeout_ms: 200,
        drain_window_ms: 1000,
    };
    PortalConfig::default()
        .with_secret(TEST_SECRET)
        .with_audit(sink.clone())
        .with_metrics(sink)
}

/// A built portal plus the principals seeded into it
pub struct Fixture {
    pub portal: Portal,
    pub clock: Arc<ManualClock>,
    pub admin: Principal,
    pub manager: Principal,
    pub designer: Principal,
    pub viewer: Principal,
}

impl std::fmt::Debug for Fixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fixture")
            .field("portal", &self.portal)
            .finish_non_exhaustive()
    }
}

impl Fixture {
    /// Default seams, test configuration
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    /// Customize the builder before it is built; the clock is always manual
    pub fn with(customize: impl FnOnce(PortalBuilder) -> PortalBuilder) -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let shared: SharedClock = clock.clone();
        let builder = Portal::builder(test_config()).with_clock(shared);
        let portal = customize(builder).build().expect("test portal builds");
        let seed = |name: &str, role: &str| {
            portal
                .register_principal(name, role, PASSWORD)
                .expect("seed principal")
        };
        let admin = seed("ada", roles::ADMIN);
        let manager = seed("grace", roles::MANAGER);
        let designer = seed("linus", roles::DESIGNER);
        let viewer = seed("barbara", roles::VIEWER);
        Self {
            portal,
            clock,
            admin,
            manager,
            designer,
            viewer,
        }
    }

    /// Mint a pair for a seeded principal
    pub async fn pair(&self, principal: &Principal) -> TokenPair {
        self.portal
            .tokens()
            .mint_pair(principal.id, &principal.name, &principal.role)
            .await
            .expect("mint pair")
    }

    /// Access token for a seeded principal
    pub async fn token(&self, principal: &Principal) -> String {
        self.pair(principal).await.access_token
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

/// `GET` with a bearer token and a peer address
pub fn get(path: &str, token: &str) -> InboundRequest {
    InboundRequest::get(path)
        .with_bearer(token)
        .with_peer("10.1.2.3:50000")
}

/// `POST` with a bearer token and a JSON body
pub fn post<T: serde::Serialize>(path: &str, token: &str, body: &T) -> InboundRequest {
    InboundRequest::post(path)
        .with_bearer(token)
        .with_peer("10.1.2.3:50000")
        .with_json(body)
}

/// Any method with a bearer token
pub fn call(method: &str, path: &str, token: &str) -> InboundRequest {
    InboundRequest::new(method, path)
        .with_bearer(token)
        .with_peer("10.1.2.3:50000")
}
