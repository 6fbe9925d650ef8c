use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{ContainerPort, EnvVar, PodSecurityContext, PodTemplateSpec},
};
use kube::ResourceExt;
use serde_json::json;

use super::{
    owner_reference, path_prefix, DEFAULT_CONTAINER_PORT, DEFAULT_FS_GROUP, DEFAULT_WORKING_DIR,
};
use crate::{
    config::Settings,
    session::{Session, SESSION_NAME_LABEL},
    Error, Result,
};

/// Desired singleton workload for a session.
///
/// The workload carries one replica unless the session is stopped or under
/// maintenance, in which case the pod is parked at zero so state survives
/// without compute (and, during maintenance, so the copy job can bind the
/// volume).
pub fn statefulset(session: &Session, settings: &Settings) -> Result<StatefulSet> {
    let name = session.name_any();
    let namespace = session
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    let replicas = if session.is_stopped() || session.in_maintenance() { 0 } else { 1 };
    let template = pod_template(session, &name, &namespace, settings)?;

    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": session.labels(),
            "ownerReferences": [owner_reference(session)?],
        },
        "spec": {
            "serviceName": name,
            "replicas": replicas,
            "selector": {
                "matchLabels": { SESSION_NAME_LABEL: name },
            },
            "template": template,
        },
    }))
    .map_err(Error::Serialization)
}

fn pod_template(
    session: &Session,
    name: &str,
    namespace: &str,
    settings: &Settings,
) -> Result<PodTemplateSpec> {
    let mut template = session.spec.template.clone();

    let pod_spec = template
        .spec
        .as_mut()
        .ok_or(Error::InvalidTemplate("spec.template.spec"))?;
    let container = pod_spec
        .containers
        .first_mut()
        .ok_or(Error::InvalidTemplate("spec.template.spec.containers"))?;

    if container.working_dir.is_none() {
        container.working_dir = Some(DEFAULT_WORKING_DIR.to_string());
    }
    let ports = container.ports.get_or_insert_with(Vec::new);
    if ports.is_empty() {
        ports.push(ContainerPort {
            container_port: DEFAULT_CONTAINER_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }
    container.env.get_or_insert_with(Vec::new).push(EnvVar {
        name: "NB_PREFIX".to_string(),
        value: Some(path_prefix(namespace, name)),
        value_from: None,
    });

    if settings.add_fsgroup && pod_spec.security_context.is_none() {
        pod_spec.security_context = Some(PodSecurityContext {
            fs_group: Some(DEFAULT_FS_GROUP),
            ..Default::default()
        });
    }

    // Template labels merge under the session's own labels, session wins.
    let metadata = template.metadata.get_or_insert_with(Default::default);
    let mut labels: BTreeMap<String, String> = metadata.labels.take().unwrap_or_default();
    for (k, v) in session.labels() {
        labels.insert(k.clone(), v.clone());
    }
    labels.insert(SESSION_NAME_LABEL.to_string(), name.to_string());
    metadata.labels = Some(labels);

    Ok(template)
}
