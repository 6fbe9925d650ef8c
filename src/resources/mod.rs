//! Generators for the child objects a session owns.
//!
//! Every generator is a pure function of the session spec plus the
//! controller settings: no randomness, no clock reads. Whatever a generator
//! emits is exactly what the diff helpers later compare against.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

use crate::{session::Session, Error, Result};

mod service;
mod statefulset;
mod virtualservice;
mod volume;

pub use service::service;
pub use statefulset::statefulset;
pub use virtualservice::{istio_api_resource, virtual_service, virtual_service_name};
pub use volume::{
    largest_claim, quantity_to_bytes, scale_job, scale_job_name, scale_quantity, scaled_claim,
};

/// Default working directory injected when the template omits one.
pub const DEFAULT_WORKING_DIR: &str = "/home/jovyan";
/// Default serving port of the session container.
pub const DEFAULT_CONTAINER_PORT: i32 = 8888;
/// Port the endpoint Service listens on.
pub const SERVICE_PORT: i32 = 80;
/// Supplementary filesystem group defaulted onto pod security contexts.
pub const DEFAULT_FS_GROUP: i64 = 100;

/// Controlling owner reference pointing at the session, so that child
/// deletion cascades with it.
pub fn owner_reference(session: &Session) -> Result<OwnerReference> {
    Ok(OwnerReference {
        api_version: Session::api_version(&()).to_string(),
        kind: Session::kind(&()).to_string(),
        name: session
            .metadata
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?,
        uid: session
            .metadata
            .uid
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?,
        controller: Some(true),
        block_owner_deletion: Some(true),
        ..OwnerReference::default()
    })
}

/// Path prefix under which the session is exposed at the cluster ingress.
pub fn path_prefix(namespace: &str, name: &str) -> String {
    format!("/session/{namespace}/{name}")
}
