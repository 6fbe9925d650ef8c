use k8s_openapi::api::core::v1::{Event as ClusterEvent, Pod};
use kube::{Api, Client, ResourceExt};

use crate::{session::SESSION_NAME_LABEL, Error, Result};

/// What a cluster event's involved object says about session ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Involved {
    /// The workload is named after its session.
    Workload(String),
    /// Pods carry the owning session in a label; resolving it needs a read.
    Pod(String),
    /// Not a child kind; such events never enter the queue.
    Unrelated,
}

pub fn involved(event: &ClusterEvent) -> Involved {
    let name = match &event.involved_object.name {
        Some(name) => name.clone(),
        None => return Involved::Unrelated,
    };
    match event.involved_object.kind.as_deref() {
        Some("StatefulSet") => Involved::Workload(name),
        Some("Pod") => Involved::Pod(name),
        _ => Involved::Unrelated,
    }
}

/// Watch-predicate check: only events about child kinds are enqueued.
pub fn is_child_event(event: &ClusterEvent) -> bool {
    involved(event) != Involved::Unrelated
}

/// Resolves the session a cluster event belongs to.
///
/// Sessions that no longer exist still resolve to their name here; the
/// caller decides what a dangling correlation means.
pub async fn session_for(
    client: &Client,
    namespace: &str,
    event: &ClusterEvent,
) -> Result<Option<String>> {
    match involved(event) {
        Involved::Workload(name) => Ok(Some(name)),
        Involved::Pod(pod_name) => {
            let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
            match pods.get_opt(&pod_name).await.map_err(Error::Kube)? {
                Some(pod) => Ok(pod.labels().get(SESSION_NAME_LABEL).cloned()),
                None => Ok(None),
            }
        }
        Involved::Unrelated => Ok(None),
    }
}

/// Message recorded on the session when a child event is re-emitted.
pub fn reissue_note(event: &ClusterEvent) -> String {
    let kind = event
        .involved_object
        .kind
        .as_deref()
        .unwrap_or("object")
        .to_lowercase();
    let name = event.involved_object.name.as_deref().unwrap_or_default();
    let message = event.message.as_deref().unwrap_or_default();
    format!("Reissued from {kind}/{name}: {message}")
}
