//! A controller for interactive compute `Session` custom resources.
//!
//! A `Session` declares a long-lived singleton workload (image, resources,
//! attached persistent volume). The controller materializes it as a
//! StatefulSet with a stable identity, a ClusterIP Service, and optionally a
//! VirtualService routing entry, then keeps converging actual state towards
//! the declared state: status reporting, idle culling, and live scale-up of
//! the backing volume.
#![forbid(unsafe_code)]

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube api error: {0}")]
    Kube(#[source] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("invalid session template: missing {0}")]
    InvalidTemplate(&'static str),

    #[error("malformed quantity: {0:?}")]
    Quantity(String),

    #[error("volume probe failed: {0}")]
    Probe(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Short static label for metrics.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::Serialization(_) => "serialization",
            Error::MissingObjectKey(_) => "missing_key",
            Error::InvalidTemplate(_) => "invalid_template",
            Error::Quantity(_) => "quantity",
            Error::Probe(_) => "probe",
        }
    }
}

/// The Session custom resource and its status types.
pub mod session;

/// Generators producing desired child objects from a Session.
pub mod resources;

/// Owned-field structural diffing and merge-patch producers.
pub mod diff;

/// Idle-culling policy.
pub mod culler;

/// Child-event to session correlation.
pub mod correlate;

/// Volume usage probing via pod exec.
pub mod probe;

/// Prometheus counters.
pub mod metrics;
pub use metrics::Metrics;

/// Environment-driven settings.
pub mod config;
pub use config::Settings;

/// The reconcile engine and manager wiring.
pub mod controller;
pub use crate::controller::{Context, State};

/// Log and trace integrations.
pub mod telemetry;

#[cfg(test)]
pub mod fixtures;
