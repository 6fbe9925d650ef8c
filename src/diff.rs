//! Structural equality and patches over the child-object fields the engine
//! owns. Anything outside the owned subset (defaulted fields, status,
//! other controllers' annotations) is left untouched.

use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Service};
use kube::{api::DynamicObject, ResourceExt};
use serde_json::{json, Value};

/// Owned StatefulSet fields: labels, replicas, selector, pod template.
pub fn statefulset_diverges(desired: &StatefulSet, observed: &StatefulSet) -> bool {
    if desired.labels() != observed.labels() {
        return true;
    }
    match (&desired.spec, &observed.spec) {
        (Some(d), Some(o)) => {
            d.replicas != o.replicas || d.selector != o.selector || d.template != o.template
        }
        _ => true,
    }
}

/// Merge patch carrying only the owned StatefulSet fields.
pub fn statefulset_patch(desired: &StatefulSet) -> Value {
    let spec = desired.spec.as_ref();
    json!({
        "metadata": { "labels": desired.labels() },
        "spec": {
            "replicas": spec.and_then(|s| s.replicas),
            "selector": spec.map(|s| &s.selector),
            "template": spec.map(|s| &s.template),
        },
    })
}

/// Owned Service fields: selector, ports, type.
pub fn service_diverges(desired: &Service, observed: &Service) -> bool {
    match (&desired.spec, &observed.spec) {
        (Some(d), Some(o)) => d.selector != o.selector || d.ports != o.ports || d.type_ != o.type_,
        _ => true,
    }
}

pub fn service_patch(desired: &Service) -> Value {
    let spec = desired.spec.as_ref();
    json!({
        "spec": {
            "selector": spec.and_then(|s| s.selector.as_ref()),
            "ports": spec.and_then(|s| s.ports.as_ref()),
            "type": spec.and_then(|s| s.type_.as_ref()),
        },
    })
}

/// The engine owns the whole routing document of a VirtualService.
pub fn virtualservice_diverges(desired: &DynamicObject, observed: &DynamicObject) -> bool {
    desired.data.get("spec") != observed.data.get("spec")
}

pub fn virtualservice_patch(desired: &DynamicObject) -> Value {
    json!({ "spec": desired.data.get("spec") })
}
