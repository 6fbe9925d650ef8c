use kube::{
    api::{ApiResource, DynamicObject},
    core::GroupVersionKind,
    ResourceExt,
};
use serde_json::json;

use super::{owner_reference, path_prefix, SERVICE_PORT};
use crate::{config::Settings, session::Session, Error, Result};

/// Request-routing entries are VirtualServices, which have no typed binding;
/// the engine handles them as dynamic objects.
pub fn istio_api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "networking.istio.io",
        "v1alpha3",
        "VirtualService",
    ))
}

pub fn virtual_service_name(namespace: &str, name: &str) -> String {
    format!("session-{namespace}-{name}")
}

/// Routing entry rewriting `/session/<ns>/<name>/` to the session endpoint.
pub fn virtual_service(session: &Session, settings: &Settings) -> Result<DynamicObject> {
    let name = session.name_any();
    let namespace = session
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let prefix = format!("{}/", path_prefix(&namespace, &name));

    let mut vs = DynamicObject::new(&virtual_service_name(&namespace, &name), &istio_api_resource())
        .within(&namespace)
        .data(json!({
            "spec": {
                "gateways": [settings.ingress_gateway],
                "hosts": ["*"],
                "http": [{
                    "match": [{ "uri": { "prefix": prefix } }],
                    "rewrite": { "uri": prefix },
                    "route": [{
                        "destination": {
                            "host": format!("{name}.{namespace}.svc.cluster.local"),
                            "port": { "number": SERVICE_PORT },
                        },
                    }],
                    "timeout": "300s",
                }],
            },
        }));
    vs.metadata.owner_references = Some(vec![owner_reference(session)?]);
    Ok(vs)
}
