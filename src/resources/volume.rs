use k8s_openapi::{
    api::{batch::v1::Job, core::v1::PersistentVolumeClaim},
    apimachinery::pkg::api::resource::Quantity,
};
use kube::ResourceExt;
use serde_json::json;

use super::owner_reference;
use crate::{
    session::{Session, SESSION_LABEL},
    Error, Result,
};

/// Prefix for generated scaled-up claim names.
pub const SCALED_CLAIM_PREFIX: &str = "session-pvc-";
/// Image used by the data-copy job.
const SCALE_JOB_IMAGE: &str = "instrumentisto/rsync-ssh:alpine";

pub fn scale_job_name(session_name: &str) -> String {
    format!("{session_name}-scale-job")
}

/// Larger replacement claim for a session's backing volume.
///
/// Name generation is delegated to the API server (`session-pvc-` prefix);
/// the claim is rediscovered through its `session` label rather than by name
/// so the procedure survives controller restarts.
pub fn scaled_claim(
    session: &Session,
    current: &PersistentVolumeClaim,
    factor: i64,
) -> Result<PersistentVolumeClaim> {
    let name = session.name_any();
    let namespace = session
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let current_spec = current
        .spec
        .as_ref()
        .ok_or(Error::MissingObjectKey(".spec"))?;
    let requested = current_spec
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .ok_or(Error::MissingObjectKey(".spec.resources.requests.storage"))?;
    let scaled = scale_quantity(requested, factor)?;

    let access_modes = current_spec
        .access_modes
        .clone()
        .unwrap_or_else(|| vec!["ReadWriteOnce".to_string()]);
    let mut spec = json!({
        "accessModes": access_modes,
        "resources": { "requests": { "storage": scaled } },
    });
    if let Some(storage_class) = &current_spec.storage_class_name {
        spec["storageClassName"] = json!(storage_class);
    }

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "generateName": SCALED_CLAIM_PREFIX,
            "namespace": namespace,
            "labels": { SESSION_LABEL: name },
        },
        "spec": spec,
    }))
    .map_err(Error::Serialization)
}

/// One-shot job mirroring the old claim's bytes onto the new claim.
pub fn scale_job(session: &Session, old_claim: &str, new_claim: &str) -> Result<Job> {
    let name = session.name_any();
    let namespace = session
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": scale_job_name(&name),
            "namespace": namespace,
            "labels": { SESSION_LABEL: name },
            "ownerReferences": [owner_reference(session)?],
        },
        "spec": {
            "backoffLimit": 6,
            "template": {
                "spec": {
                    "restartPolicy": "OnFailure",
                    "containers": [{
                        "name": "rsync",
                        "image": SCALE_JOB_IMAGE,
                        "command": ["rsync", "-aHAX", "/old/", "/new/"],
                        "volumeMounts": [
                            { "name": "old", "mountPath": "/old", "readOnly": true },
                            { "name": "new", "mountPath": "/new" },
                        ],
                    }],
                    "volumes": [
                        {
                            "name": "old",
                            "persistentVolumeClaim": { "claimName": old_claim, "readOnly": true },
                        },
                        {
                            "name": "new",
                            "persistentVolumeClaim": { "claimName": new_claim },
                        },
                    ],
                },
            },
        },
    }))
    .map_err(Error::Serialization)
}

/// Picks the claim with the largest storage request; ties keep the first
/// encountered in list order.
pub fn largest_claim(claims: Vec<PersistentVolumeClaim>) -> Option<PersistentVolumeClaim> {
    let mut best: Option<(u128, PersistentVolumeClaim)> = None;
    for claim in claims {
        let bytes = claim
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .and_then(|q| quantity_to_bytes(q).ok());
        let Some(bytes) = bytes else { continue };
        match &best {
            Some((top, _)) if bytes <= *top => {}
            _ => best = Some((bytes, claim)),
        }
    }
    best.map(|(_, claim)| claim)
}

/// Multiplies an integral quantity, preserving its suffix (`10Gi` x 2 = `20Gi`).
pub fn scale_quantity(quantity: &Quantity, factor: i64) -> Result<Quantity> {
    if factor <= 0 {
        return Err(Error::Quantity(format!("scale factor {factor}")));
    }
    let raw = quantity.0.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);
    let value: u128 = digits.parse().map_err(|_| Error::Quantity(raw.to_string()))?;
    if !suffix.is_empty() {
        // Validate the suffix so malformed quantities fail here, not in the API server.
        suffix_multiplier(suffix).ok_or_else(|| Error::Quantity(raw.to_string()))?;
    }
    Ok(Quantity(format!("{}{}", value * factor as u128, suffix)))
}

/// Resolves an integral Kubernetes quantity to bytes.
pub fn quantity_to_bytes(quantity: &Quantity) -> Result<u128> {
    let raw = quantity.0.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);
    let value: u128 = digits.parse().map_err(|_| Error::Quantity(raw.to_string()))?;
    let multiplier = if suffix.is_empty() {
        1
    } else {
        suffix_multiplier(suffix).ok_or_else(|| Error::Quantity(raw.to_string()))?
    };
    Ok(value * multiplier)
}

fn suffix_multiplier(suffix: &str) -> Option<u128> {
    match suffix {
        "Ki" => Some(1 << 10),
        "Mi" => Some(1 << 20),
        "Gi" => Some(1 << 30),
        "Ti" => Some(1 << 40),
        "Pi" => Some(1 << 50),
        "Ei" => Some(1 << 60),
        "k" => Some(1_000),
        "M" => Some(1_000_000),
        "G" => Some(1_000_000_000),
        "T" => Some(1_000_000_000_000),
        "P" => Some(1_000_000_000_000_000),
        "E" => Some(1_000_000_000_000_000_000),
        _ => None,
    }
}
