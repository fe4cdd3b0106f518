//! Fault injection for the write-behind sinks
//!
//! [`FaultyWriter`] stands in for an audit or metrics store that fails or
//! hangs. [`audit_load`] drives guarded requests through a portal whose audit
//! store always fails, and reports what the callers and the sink observed.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::info;

use rdp_access::{InboundRequest, RecordWriter, SinkStats, WriteError};
use rdp_types::{roles, AuditRecord};

use crate::config::PortalConfig;
use crate::error::KernelResult;
use crate::portal::Portal;

/// How a [`FaultyWriter`] misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every write returns an error
    Fail,
    /// Every write sleeps before succeeding
    Stall(Duration),
}

/// Record writer with an injected fault
pub struct FaultyWriter<T> {
    fault: Fault,
    calls: AtomicU64,
    _record: PhantomData<fn(T)>,
}

impl<T> FaultyWriter<T> {
    #[must_use]
    pub fn new(fault: Fault) -> Self {
        Self {
            fault,
            calls: AtomicU64::new(0),
            _record: PhantomData,
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self::new(Fault::Fail)
    }

    #[must_use]
    pub fn stalling(delay: Duration) -> Self {
        Self::new(Fault::Stall(delay))
    }

    /// Writes attempted so far
    #[inline]
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl<T> std::fmt::Debug for FaultyWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyWriter")
            .field("fault", &self.fault)
            .field("calls", &self.calls())
            .finish()
    }
}

#[async_trait]
impl<T: Send + 'static> RecordWriter<T> for FaultyWriter<T> {
    async fn write(&self, _record: T) -> Result<(), WriteError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.fault {
            Fault::Fail => Err(WriteError::Failed("injected write failure".into())),
            Fault::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// Outcome of [`audit_load`]
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub requests: usize,
    /// Replies with status 200
    pub succeeded: usize,
    /// Replies with status 500
    pub server_errors: usize,
    pub max_latency_ms: u64,
    /// Audit sink counters after shutdown
    pub audit: SinkStats,
    /// Writes the failing store received
    pub writer_calls: u64,
}

/// Send `requests` authenticated reads through a portal whose audit store
/// rejects every write, then shut it down and collect the counters.
pub async fn audit_load(config: PortalConfig, requests: usize) -> KernelResult<LoadReport> {
    let writer = Arc::new(FaultyWriter::<AuditRecord>::failing());
    let portal = Portal::builder(config)
        .with_audit_writer(writer.clone())
        .build()?;

    let principal = portal.register_principal("load-driver", roles::DESIGNER, "load-driver-pw")?;
    let pair = portal
        .tokens()
        .mint_pair(principal.id, &principal.name, &principal.role)
        .await?;

    let calls = (0..requests).map(|_| {
        let req = InboundRequest::get("/api/v1/workflows")
            .with_bearer(&pair.access_token)
            .with_peer("127.0.0.1:40000");
        let portal = &portal;
        async move {
            let started = Instant::now();
            let reply = portal.handle(req).await;
            (reply.status, started.elapsed())
        }
    });
    let outcomes = join_all(calls).await;
    let report = portal.shutdown().await;

    let max_latency = outcomes
        .iter()
        .map(|(_, elapsed)| *elapsed)
        .max()
        .unwrap_or_default();
    let load = LoadReport {
        requests,
        succeeded: outcomes.iter().filter(|(status, _)| *status == 200).count(),
        server_errors: outcomes.iter().filter(|(status, _)| *status == 500).count(),
        max_latency_ms: u64::try_from(max_latency.as_millis()).unwrap_or(u64::MAX),
        audit: report.audit,
        writer_calls: writer.calls(),
    };
    info!(
        requests,
        succeeded = load.succeeded,
        audit_failed = load.audit.failed,
        audit_dropped = load.audit.dropped,
        "audit load finished"
    );
    Ok(load)
}
