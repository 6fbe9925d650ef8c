use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::core::v1::{ContainerState, PodTemplateSpec},
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::CustomResource;
use schemars::{
    gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
    JsonSchema,
};
use serde::{Deserialize, Serialize};

/// Annotation recording the last observed user activity (RFC 3339), written
/// by the external activity probe.
pub const LAST_ACTIVITY_ANNOTATION: &str = "sessions.example.org/last-activity";
/// Annotation telling the workload generator to emit zero replicas. Set by
/// the culler; cleared externally when activity resumes.
pub const STOP_ANNOTATION: &str = "sessions.example.org/stopped";
/// Reserved session label carrying `"true"` while a volume scale-up is in
/// progress.
pub const MAINTENANCE_LABEL: &str = "maintenance";
/// Label stamped on every session pod, used to correlate pod events back to
/// the owning session.
pub const SESSION_NAME_LABEL: &str = "session-name";
/// Label carried by volume claims and the scale job so the engine can
/// rediscover them across restarts.
pub const SESSION_LABEL: &str = "session";

/// Conditions are a newest-first history, bounded to a reasonable tail.
pub const MAX_CONDITIONS: usize = 100;

/// Desired state of one interactive compute session.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "sessions.example.org",
    version = "v1beta1",
    kind = "Session",
    namespaced
)]
#[kube(status = "SessionStatus", shortname = "sess")]
pub struct SessionSpec {
    /// Full pod template for the session workload. The generator fills in
    /// defaults (working dir, port, path-prefix env) for omitted fields.
    #[schemars(schema_with = "pod_template_schema")]
    pub template: PodTemplateSpec,

    /// Optional volume scale-up policy. When set, the controller probes the
    /// backing claim's utilization and grows it past the threshold.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "scalePVC")]
    pub scale_pvc: Option<ScalePvc>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalePvc {
    /// Utilization percentage above which scale-up is triggered.
    pub threshold: i64,
    /// Multiplier applied to the claim's requested storage.
    pub scale_factor: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Ready replicas reported by the child workload (0 or 1).
    #[serde(default)]
    pub ready_replicas: i32,

    /// Last observed state of the session container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "container_state_schema")]
    pub container_state: Option<ContainerState>,

    /// Newest-first condition history; consecutive duplicates are coalesced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SessionCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionCondition {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "time_schema")]
    pub last_probe_time: Option<Time>,
}

impl SessionCondition {
    /// Identity used for coalescing; probe times are ignored.
    fn key(&self) -> (&str, Option<&str>, Option<&str>) {
        (&self.type_, self.reason.as_deref(), self.message.as_deref())
    }
}

impl Session {
    pub fn in_maintenance(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(MAINTENANCE_LABEL))
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn is_stopped(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .map(|a| a.contains_key(STOP_ANNOTATION))
            .unwrap_or(false)
    }

    /// Last recorded user activity, if the activity probe has reported any.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        let raw = self.metadata.annotations.as_ref()?.get(LAST_ACTIVITY_ANNOTATION)?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Maps a container state onto the session condition it implies.
///
/// For a terminated container the message duplicates the reason; consumers
/// depend on this shape.
pub fn condition_for(state: &ContainerState, now: Time) -> Option<SessionCondition> {
    let (type_, reason, message) = if state.running.is_some() {
        ("Running", None, None)
    } else if let Some(waiting) = &state.waiting {
        ("Waiting", waiting.reason.clone(), waiting.message.clone())
    } else if let Some(terminated) = &state.terminated {
        ("Terminated", terminated.reason.clone(), terminated.reason.clone())
    } else {
        return None;
    };
    Some(SessionCondition {
        type_: type_.to_string(),
        reason,
        message,
        last_probe_time: Some(now),
    })
}

/// Prepends `next` unless the head already carries the same
/// `(type, reason, message)`, keeping the history bounded.
pub fn push_condition(
    mut conditions: Vec<SessionCondition>,
    next: SessionCondition,
) -> Vec<SessionCondition> {
    let duplicate = conditions.first().map(|head| head.key() == next.key()).unwrap_or(false);
    if !duplicate {
        conditions.insert(0, next);
        conditions.truncate(MAX_CONDITIONS);
    }
    conditions
}

fn pod_template_schema(_: &mut SchemaGenerator) -> Schema {
    // Embedded upstream type; validated by the kubelet, not the CRD schema.
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

fn container_state_schema(generator: &mut SchemaGenerator) -> Schema {
    pod_template_schema(generator)
}

fn time_schema(_: &mut SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::String.into()),
        format: Some("date-time".to_string()),
        ..Default::default()
    })
}
