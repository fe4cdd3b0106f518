//! RDP Workflow - the workflow engine of the portal core
//!
//! Provides:
//! - Declarative transition tables for workflows, activities and reviews
//! - A dependency graph that refuses cycles at insertion time
//! - Start and finish gating by dependency type
//! - Progress aggregation from activities up to the workflow
//! - A review coordinator that feeds decisions back into activities
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rdp_workflow::{MemoryStore, WorkflowEngine};
//! use rdp_types::{NewWorkflow, ProjectId, PrincipalId, SystemClock, WorkflowState};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = WorkflowEngine::new(Arc::new(MemoryStore::new()), SystemClock::shared());
//! let wf = engine
//!     .create_workflow(NewWorkflow::new(ProjectId::new(), "tape-out", PrincipalId::new()))
//!     .await?;
//! engine.transition_workflow(wf.id, WorkflowState::Planning).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod engine;
pub mod error;
pub mod fsm;
pub mod graph;
pub mod progress;
pub mod reviews;
pub mod store;

pub use engine::{EngineConfig, WorkflowEngine, WorkflowFilter};
pub use error::{StoreError, TransitionError, WorkflowError, WorkflowResult};
pub use fsm::{matrix, render_grid, Lifecycle, MatrixRow};
pub use graph::{resolve, DependencyGraph, Gate, Readiness};
pub use progress::{aggregate, ProgressReport};
pub use reviews::ReviewCoordinator;
pub use store::{CascadeSummary, MemoryStore, WorkflowStore};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the workflow engine
    pub use crate::{
        Lifecycle, MemoryStore, ReviewCoordinator, WorkflowEngine, WorkflowError, WorkflowStore,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
