use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use serde_json::json;

use super::{owner_reference, DEFAULT_CONTAINER_PORT, SERVICE_PORT};
use crate::{
    session::{Session, SESSION_NAME_LABEL},
    Error, Result,
};

/// Stable intra-cluster endpoint for a session.
///
/// Serves on port 80 and forwards to the first declared container port,
/// defaulting to 8888 when the template declares none.
pub fn service(session: &Session) -> Result<Service> {
    let name = session.name_any();
    let namespace = session
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let target_port = first_container_port(session)?;

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": session.labels(),
            "ownerReferences": [owner_reference(session)?],
        },
        "spec": {
            "type": "ClusterIP",
            "selector": { SESSION_NAME_LABEL: name },
            "ports": [{
                "name": "http",
                "protocol": "TCP",
                "port": SERVICE_PORT,
                "targetPort": target_port,
            }],
        },
    }))
    .map_err(Error::Serialization)
}

fn first_container_port(session: &Session) -> Result<i32> {
    let containers = &session
        .spec
        .template
        .spec
        .as_ref()
        .ok_or(Error::InvalidTemplate("spec.template.spec"))?
        .containers;
    let container = containers
        .first()
        .ok_or(Error::InvalidTemplate("spec.template.spec.containers"))?;
    Ok(container
        .ports
        .as_ref()
        .and_then(|ports| ports.first())
        .map(|p| p.container_port)
        .unwrap_or(DEFAULT_CONTAINER_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_session;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    #[test]
    fn serves_port_80_towards_first_container_port() {
        let service = service(&sample_session("testsession", "testns")).unwrap();
        assert_eq!(service.metadata.name.as_deref(), Some("testsession"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(
            spec.selector.as_ref().unwrap().get(SESSION_NAME_LABEL),
            Some(&"testsession".to_string())
        );
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 80);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8888)));
    }

    #[test]
    fn defaults_target_port_when_template_declares_none() {
        let mut session = sample_session("s", "n");
        session.spec.template.spec.as_mut().unwrap().containers[0].ports = None;
        let service = service(&session).unwrap();
        let ports = service.spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8888)));
    }
}
