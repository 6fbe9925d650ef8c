use prometheus::{opts, IntCounterVec, Registry};

use crate::Error;

/// Counters the engine reports, keyed by namespace (reconcile failures by
/// error kind instead).
#[derive(Clone)]
pub struct Metrics {
    pub sessions_created: IntCounterVec,
    pub session_create_failures: IntCounterVec,
    pub sessions_culled: IntCounterVec,
    pub reconcile_failures: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let sessions_created = IntCounterVec::new(
            opts!("session_create_total", "Session workloads created"),
            &["namespace"],
        )
        .unwrap();
        let session_create_failures = IntCounterVec::new(
            opts!("session_create_failed_total", "Session workload creations that failed"),
            &["namespace"],
        )
        .unwrap();
        let sessions_culled = IntCounterVec::new(
            opts!("session_culling_total", "Sessions idled by the culler"),
            &["namespace"],
        )
        .unwrap();
        let reconcile_failures = IntCounterVec::new(
            opts!("session_reconcile_failures_total", "Reconciliations that returned an error"),
            &["error"],
        )
        .unwrap();
        Metrics {
            sessions_created,
            session_create_failures,
            sessions_culled,
            reconcile_failures,
        }
    }
}

impl Metrics {
    /// Registers all counters into `registry`.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.sessions_created.clone()))?;
        registry.register(Box::new(self.session_create_failures.clone()))?;
        registry.register(Box::new(self.sessions_culled.clone()))?;
        registry.register(Box::new(self.reconcile_failures.clone()))?;
        Ok(self)
    }

    pub fn created(&self, namespace: &str) {
        self.sessions_created.with_label_values(&[namespace]).inc();
    }

    pub fn create_failed(&self, namespace: &str) {
        self.session_create_failures.with_label_values(&[namespace]).inc();
    }

    pub fn culled(&self, namespace: &str) {
        self.sessions_culled.with_label_values(&[namespace]).inc();
    }

    pub fn reconcile_failure(&self, error: &Error) {
        self.reconcile_failures
            .with_label_values(&[error.metric_label()])
            .inc();
    }
}
