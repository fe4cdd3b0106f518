//! RDP Kernel (rdp-kernel) - the portal facade
//!
//! Wires the workflow engine and the access core behind one request entry
//! point:
//! 1. **Configuration**: TOML file plus `RDP_*` environment overrides
//! 2. **Directory**: principals and their salted credentials
//! 3. **Portal**: route table, guard and handlers over [`InboundRequest`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use rdp_kernel::prelude::*;
//!
//! let config = PortalConfig::load(None)?.apply_env()?;
//! let portal = Portal::builder(config).build()?;
//! let reply = portal.handle(InboundRequest::get("/health")).await;
//! assert!(reply.is_success());
//! portal.shutdown().await;
//! ```
//!
//! [`InboundRequest`]: rdp_access::InboundRequest

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod directory;
pub mod error;
pub mod load;
pub mod portal;
pub mod scenario;
pub mod telemetry;

pub use config::{ConfigError, LogFormat, PortalConfig};
pub use directory::{Directory, DirectoryError};
pub use error::{KernelError, KernelResult};
pub use load::{audit_load, Fault, FaultyWriter, LoadReport};
pub use portal::{Portal, PortalBuilder, PortalStats, ShutdownReport};
pub use scenario::{happy_path, ScenarioReport};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running a portal
    pub use crate::{Directory, KernelError, Portal, PortalConfig};
    pub use rdp_access::{ApiReply, InboundRequest};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
