use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::{
    api::{
        apps::v1::StatefulSet,
        batch::v1::Job,
        core::v1::{ContainerState, Event as ClusterEvent, PersistentVolumeClaim, Pod, Service, Volume},
        storage::v1::StorageClass,
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::Time},
};
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        events::{Event, EventType, Recorder, Reporter},
        reflector::ObjectRef,
        watcher,
    },
    Client, Resource, ResourceExt,
};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::Settings,
    correlate, culler, diff,
    metrics::Metrics,
    probe, resources,
    session::{self, ScalePvc, Session, MAINTENANCE_LABEL, SESSION_LABEL, STOP_ANNOTATION, SESSION_NAME_LABEL},
    Error, Result,
};

/// Identity the event recorder reports under.
pub const CONTROLLER_NAME: &str = "session-controller";

/// Diagnostics shared with whoever hosts the controller.
#[derive(Clone, Debug)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics {
            last_event: Utc::now(),
            reporter: CONTROLLER_NAME.into(),
        }
    }
}

/// State passed through to every reconcile invocation.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub settings: Settings,
    pub metrics: Metrics,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub recorder: Recorder,
    /// Serializes dispatch across both trigger streams; the scale-up state
    /// machine must never interleave with itself.
    pub(crate) sync: Arc<Mutex<()>>,
}

/// Process-level state owned by `main`, from which reconcile contexts are
/// derived.
#[derive(Clone, Default)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    registry: prometheus::Registry,
    settings: Settings,
}

impl State {
    pub fn new(settings: Settings) -> Self {
        State { settings, ..State::default() }
    }

    /// Gathered metrics for exposition.
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            settings: self.settings.clone(),
            metrics: Metrics::default().register(&self.registry).unwrap(),
            diagnostics: self.diagnostics.clone(),
            recorder: Recorder::new(client, CONTROLLER_NAME.into()),
            sync: Arc::new(Mutex::new(())),
        })
    }
}

/// Reconcile entry point for session-keyed requests.
#[instrument(skip(session, ctx), fields(session = %session.name_any()))]
pub async fn reconcile_session(session: Arc<Session>, ctx: Arc<Context>) -> Result<Action> {
    let _serialized = ctx.sync.lock().await;
    ctx.diagnostics.write().await.last_event = Utc::now();
    let namespace = session
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    dispatch(&ctx, &namespace, &session.name_any()).await
}

/// Reconcile entry point for event-keyed requests. Shares the queue
/// semantics (dedup, backoff, serialization) with session requests.
#[instrument(skip(event, ctx), fields(event = %event.name_any()))]
pub async fn reconcile_cluster_event(event: Arc<ClusterEvent>, ctx: Arc<Context>) -> Result<Action> {
    if !correlate::is_child_event(&event) {
        return Ok(Action::await_change());
    }
    let _serialized = ctx.sync.lock().await;
    ctx.diagnostics.write().await.last_event = Utc::now();
    let namespace = event
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    dispatch(&ctx, &namespace, &event.name_any()).await
}

pub fn error_policy(session: Arc<Session>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(session = %session.name_any(), %error, "reconcile failed");
    ctx.metrics.reconcile_failure(error);
    Action::requeue(Duration::from_secs(5))
}

pub fn event_error_policy(event: Arc<ClusterEvent>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(event = %event.name_any(), %error, "event reissue failed");
    ctx.metrics.reconcile_failure(error);
    Action::requeue(Duration::from_secs(5))
}

/// One queue, two request shapes: the key is first read as a cluster event
/// (re-emission), falling through to session convergence on not-found.
async fn dispatch(ctx: &Context, namespace: &str, name: &str) -> Result<Action> {
    let events: Api<ClusterEvent> = Api::namespaced(ctx.client.clone(), namespace);
    if let Some(event) = events.get_opt(name).await.map_err(Error::Kube)? {
        return reissue(ctx, namespace, &event).await;
    }

    let sessions: Api<Session> = Api::namespaced(ctx.client.clone(), namespace);
    match sessions.get_opt(name).await.map_err(Error::Kube)? {
        Some(current) => converge(ctx, &current).await,
        // Deleted; children cascade through their owner references.
        None => Ok(Action::await_change()),
    }
}

/// Records a child's event against its owning session.
async fn reissue(ctx: &Context, namespace: &str, event: &ClusterEvent) -> Result<Action> {
    let Some(session_name) = correlate::session_for(&ctx.client, namespace, event).await? else {
        return Ok(Action::await_change());
    };
    let sessions: Api<Session> = Api::namespaced(ctx.client.clone(), namespace);
    let Some(current) = sessions.get_opt(&session_name).await.map_err(Error::Kube)? else {
        // The session vanished between the child event and this cycle.
        return Ok(Action::await_change());
    };

    let type_ = match event.type_.as_deref() {
        Some("Warning") => EventType::Warning,
        _ => EventType::Normal,
    };
    ctx.recorder
        .publish(
            &Event {
                type_,
                reason: event.reason.clone().unwrap_or_else(|| "Unknown".to_string()),
                note: Some(correlate::reissue_note(event)),
                action: "Reissue".to_string(),
                secondary: None,
            },
            &current.object_ref(&()),
        )
        .await
        .map_err(Error::Kube)?;
    Ok(Action::await_change())
}

/// The convergence steps, in order. Each step reads what it needs and writes
/// at most one divergence; nothing observed in one cycle is assumed in the
/// next.
async fn converge(ctx: &Context, current: &Session) -> Result<Action> {
    let name = current.name_any();
    let namespace = current
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let sessions: Api<Session> = Api::namespaced(ctx.client.clone(), &namespace);
    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);

    // Workload convergence.
    let desired_workload = match resources::statefulset(current, &ctx.settings) {
        Ok(desired) => desired,
        Err(error @ Error::InvalidTemplate(_)) => return fail_generation(ctx, current, error).await,
        Err(error) => return Err(error),
    };
    let workload = match statefulsets.get_opt(&name).await.map_err(Error::Kube)? {
        None => match statefulsets.create(&PostParams::default(), &desired_workload).await {
            Ok(created) => {
                info!(%namespace, %name, "created workload");
                ctx.metrics.created(&namespace);
                created
            }
            Err(error) => {
                ctx.metrics.create_failed(&namespace);
                publish(
                    ctx,
                    current,
                    EventType::Warning,
                    "FailedCreate",
                    format!("Failed to create workload {namespace}/{name}: {error}"),
                )
                .await;
                return Err(Error::Kube(error));
            }
        },
        Some(found) => {
            if !current.in_maintenance() && diff::statefulset_diverges(&desired_workload, &found) {
                match statefulsets
                    .patch(
                        &name,
                        &PatchParams::default(),
                        &Patch::Merge(diff::statefulset_patch(&desired_workload)),
                    )
                    .await
                {
                    Ok(patched) => {
                        debug!(%namespace, %name, "patched workload");
                        patched
                    }
                    Err(error) => {
                        publish(
                            ctx,
                            current,
                            EventType::Warning,
                            "FailedUpdate",
                            format!("Failed to update workload {namespace}/{name}: {error}"),
                        )
                        .await;
                        return Err(Error::Kube(error));
                    }
                }
            } else {
                found
            }
        }
    };

    // Endpoint convergence.
    let desired_endpoint = match resources::service(current) {
        Ok(desired) => desired,
        Err(error @ Error::InvalidTemplate(_)) => return fail_generation(ctx, current, error).await,
        Err(error) => return Err(error),
    };
    match services.get_opt(&name).await.map_err(Error::Kube)? {
        None => {
            if let Err(error) = services.create(&PostParams::default(), &desired_endpoint).await {
                publish(
                    ctx,
                    current,
                    EventType::Warning,
                    "FailedCreate",
                    format!("Failed to create endpoint {namespace}/{name}: {error}"),
                )
                .await;
                return Err(Error::Kube(error));
            }
            info!(%namespace, %name, "created endpoint");
        }
        Some(found) => {
            if !current.in_maintenance() && diff::service_diverges(&desired_endpoint, &found) {
                if let Err(error) = services
                    .patch(
                        &name,
                        &PatchParams::default(),
                        &Patch::Merge(diff::service_patch(&desired_endpoint)),
                    )
                    .await
                {
                    publish(
                        ctx,
                        current,
                        EventType::Warning,
                        "FailedUpdate",
                        format!("Failed to update endpoint {namespace}/{name}: {error}"),
                    )
                    .await;
                    return Err(Error::Kube(error));
                }
                debug!(%namespace, %name, "patched endpoint");
            }
        }
    }

    // Ingress convergence.
    if ctx.settings.use_ingress {
        converge_routing(ctx, current, &namespace, &name).await?;
    }

    // Ready-replicas status.
    let observed_ready = workload.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
    let recorded_ready = current.status.as_ref().map(|s| s.ready_replicas).unwrap_or(0);
    if observed_ready != recorded_ready {
        sessions
            .patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": { "readyReplicas": observed_ready } })),
            )
            .await
            .map_err(Error::Kube)?;
    }

    // Container-state status, from the singleton pod.
    let pod = pods.get_opt(&format!("{name}-0")).await.map_err(Error::Kube)?;
    if let Some(pod) = &pod {
        if let Some(state) = first_container_state(pod) {
            let recorded = current.status.as_ref().and_then(|s| s.container_state.as_ref());
            if recorded != Some(state) {
                let previous = current
                    .status
                    .as_ref()
                    .map(|s| s.conditions.clone())
                    .unwrap_or_default();
                let conditions = match session::condition_for(state, Time(Utc::now())) {
                    Some(next) => session::push_condition(previous, next),
                    None => previous,
                };
                sessions
                    .patch_status(
                        &name,
                        &PatchParams::default(),
                        &Patch::Merge(json!({
                            "status": { "containerState": state, "conditions": conditions },
                        })),
                    )
                    .await
                    .map_err(Error::Kube)?;
            }
        }

        // A crashed pod under maintenance holds the volume the copy job
        // needs; park the workload so the claim is released.
        if current.in_maintenance() && first_container_terminated(pod) {
            let replicas = workload.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            if replicas > 0 {
                statefulsets
                    .patch(
                        &name,
                        &PatchParams::default(),
                        &Patch::Merge(json!({ "spec": { "replicas": 0 } })),
                    )
                    .await
                    .map_err(Error::Kube)?;
                info!(%namespace, %name, "parked workload for volume handover");
            }
        }
    }

    // Scale-up: progression under maintenance, otherwise the proactive check.
    if current.in_maintenance() {
        complete_scale_up(ctx, current, &sessions, &statefulsets).await?;
    } else if let (Some(pod), Some(policy)) = (&pod, &current.spec.scale_pvc) {
        check_scale_up(ctx, current, &sessions, &pods, pod, policy).await?;
    }

    // Idle culling.
    if pod.is_some() && culler::needs_culling(current, Utc::now(), &ctx.settings) {
        sessions
            .patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(json!({
                    "metadata": { "annotations": { STOP_ANNOTATION: Utc::now().to_rfc3339() } },
                })),
            )
            .await
            .map_err(Error::Kube)?;
        ctx.metrics.culled(&namespace);
        info!(%namespace, %name, "culled idle session");
        return Ok(Action::await_change());
    }

    if current.in_maintenance() || (ctx.settings.enable_culling && !current.is_stopped()) {
        return Ok(Action::requeue(ctx.settings.cull_period));
    }
    Ok(Action::await_change())
}

async fn converge_routing(ctx: &Context, current: &Session, namespace: &str, name: &str) -> Result<()> {
    let api_resource = resources::istio_api_resource();
    let routes: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), namespace, &api_resource);
    let desired = resources::virtual_service(current, &ctx.settings)?;
    let route_name = resources::virtual_service_name(namespace, name);

    match routes.get_opt(&route_name).await.map_err(Error::Kube)? {
        None => {
            if let Err(error) = routes.create(&PostParams::default(), &desired).await {
                publish(
                    ctx,
                    current,
                    EventType::Warning,
                    "FailedCreate",
                    format!("Failed to create routing entry {route_name}: {error}"),
                )
                .await;
                return Err(Error::Kube(error));
            }
            info!(%namespace, %name, "created routing entry");
        }
        Some(found) => {
            if !current.in_maintenance() && diff::virtualservice_diverges(&desired, &found) {
                if let Err(error) = routes
                    .patch(
                        &route_name,
                        &PatchParams::default(),
                        &Patch::Merge(diff::virtualservice_patch(&desired)),
                    )
                    .await
                {
                    publish(
                        ctx,
                        current,
                        EventType::Warning,
                        "FailedUpdate",
                        format!("Failed to update routing entry {route_name}: {error}"),
                    )
                    .await;
                    return Err(Error::Kube(error));
                }
                debug!(%namespace, %name, "patched routing entry");
            }
        }
    }
    Ok(())
}

/// `ScaleRemount`: once the copy job reports success, repoint the session at
/// the largest labeled claim and leave maintenance.
async fn complete_scale_up(
    ctx: &Context,
    current: &Session,
    sessions: &Api<Session>,
    statefulsets: &Api<StatefulSet>,
) -> Result<()> {
    let name = current.name_any();
    let namespace = current
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(job) = jobs
        .get_opt(&resources::scale_job_name(&name))
        .await
        .map_err(Error::Kube)?
    else {
        // Crashed between the maintenance commit and materialization;
        // rebuild the missing claim and job from the template's claim.
        return resume_scale_materialization(ctx, current).await;
    };
    if job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) == 0 {
        return Ok(());
    }

    let claims: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &namespace);
    let labeled = claims
        .list(&ListParams::default().labels(&format!("{SESSION_LABEL}={name}")))
        .await
        .map_err(Error::Kube)?;
    let Some(target) = resources::largest_claim(labeled.items) else {
        return Ok(());
    };
    let target_name = target.name_any();

    // The workload must release the old claim before remount; it is
    // regenerated against the new claim on the next cycle.
    match statefulsets.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(response)) if response.code == 404 => {}
        Err(error) => return Err(Error::Kube(error)),
    }

    let volumes = remounted_volumes(current, &target_name)?;
    sessions
        .patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(json!({
                "metadata": { "labels": { MAINTENANCE_LABEL: "false" } },
                "spec": { "template": { "spec": { "volumes": volumes } } },
            })),
        )
        .await
        .map_err(Error::Kube)?;

    info!(%namespace, %name, %target_name, "volume scale-up complete");
    publish(
        ctx,
        current,
        EventType::Normal,
        "ScaleCompleted",
        format!("Session volume remounted onto {target_name}"),
    )
    .await;
    Ok(())
}

/// Proactive utilization check, entering `ScaleTriggered` when the volume
/// runs hot and the driver declines an in-place expansion.
async fn check_scale_up(
    ctx: &Context,
    current: &Session,
    sessions: &Api<Session>,
    pods: &Api<Pod>,
    pod: &Pod,
    policy: &ScalePvc,
) -> Result<()> {
    let name = current.name_any();
    let namespace = current
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let Some((claim_name, mount_path, container)) = claim_mount(pod) else {
        return Ok(());
    };

    let claims: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(claim) = claims.get_opt(&claim_name).await.map_err(Error::Kube)? else {
        return Ok(());
    };
    let Some(requested) = claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .cloned()
    else {
        return Ok(());
    };
    let capacity = resources::quantity_to_bytes(&requested)?;

    let used = match probe::used_bytes(pods, &pod.name_any(), &container, &mount_path).await {
        Ok(bytes) => bytes,
        Err(Error::Probe(message)) => {
            warn!(%namespace, %name, %message, "volume probe failed; skipping scale check");
            publish(
                ctx,
                current,
                EventType::Warning,
                "ProbeFailed",
                format!("Volume usage probe failed: {message}"),
            )
            .await;
            return Ok(());
        }
        Err(error) => return Err(error),
    };
    let percent = probe::usage_percent(used, capacity);
    debug!(%namespace, %name, %percent, "volume utilization");
    if percent <= policy.threshold as u64 {
        return Ok(());
    }

    let scaled = resources::scale_quantity(&requested, policy.scale_factor)?;
    if expand_in_place(ctx, &claims, &claim, &scaled).await? {
        info!(%namespace, %name, %claim_name, "expanded volume in place");
        publish(
            ctx,
            current,
            EventType::Normal,
            "ScaleCompleted",
            format!("Expanded claim {claim_name} to {}", scaled.0),
        )
        .await;
        return Ok(());
    }

    // `ScaleTriggered`: label the current claim so both generations stay
    // rediscoverable, then commit the transition with the maintenance label.
    // Claim and job materialization is resumable from that single write;
    // the maintenance branch re-runs it while the scale job is missing.
    claims
        .patch(
            &claim_name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "metadata": { "labels": { SESSION_LABEL: name } } })),
        )
        .await
        .map_err(Error::Kube)?;
    sessions
        .patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "metadata": { "labels": { MAINTENANCE_LABEL: "true" } } })),
        )
        .await
        .map_err(Error::Kube)?;

    let new_claim = ensure_scale_artifacts(ctx, current, &claims, &claim, policy.scale_factor).await?;

    info!(%namespace, %name, %percent, %new_claim, "volume scale-up started");
    publish(
        ctx,
        current,
        EventType::Normal,
        "ScaleInitiated",
        format!(
            "Volume utilization {percent}% exceeded {}%; copying {claim_name} onto {new_claim}",
            policy.threshold,
        ),
    )
    .await;
    Ok(())
}

/// Materializes the scale-up artifacts: the larger labeled claim and the
/// copy job. Idempotent, so `ScaleTriggered` can resume from the
/// maintenance commit alone after a crash.
async fn ensure_scale_artifacts(
    ctx: &Context,
    current: &Session,
    claims: &Api<PersistentVolumeClaim>,
    old_claim: &PersistentVolumeClaim,
    factor: i64,
) -> Result<String> {
    let name = current.name_any();
    let namespace = current
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let old_name = old_claim.name_any();

    let labeled = claims
        .list(&ListParams::default().labels(&format!("{SESSION_LABEL}={name}")))
        .await
        .map_err(Error::Kube)?;
    let replacements: Vec<PersistentVolumeClaim> = labeled
        .items
        .into_iter()
        .filter(|claim| claim.name_any() != old_name)
        .collect();
    let new_name = match resources::largest_claim(replacements) {
        Some(existing) => existing.name_any(),
        None => {
            let scaled = resources::scaled_claim(current, old_claim, factor)?;
            claims
                .create(&PostParams::default(), &scaled)
                .await
                .map_err(Error::Kube)?
                .name_any()
        }
    };

    let job = resources::scale_job(current, &old_name, &new_name)?;
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    match jobs.create(&PostParams::default(), &job).await {
        Ok(_) => {}
        Err(kube::Error::Api(response)) if response.code == 409 => {}
        Err(error) => return Err(Error::Kube(error)),
    }
    Ok(new_name)
}

/// Picks up a `ScaleTriggered` transition that committed maintenance but
/// died before its artifacts existed.
async fn resume_scale_materialization(ctx: &Context, current: &Session) -> Result<()> {
    let Some(policy) = &current.spec.scale_pvc else {
        return Ok(());
    };
    let Some(old_name) = template_claim_name(current) else {
        return Ok(());
    };
    let namespace = current
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let claims: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(old_claim) = claims.get_opt(&old_name).await.map_err(Error::Kube)? else {
        return Ok(());
    };
    let new_claim =
        ensure_scale_artifacts(ctx, current, &claims, &old_claim, policy.scale_factor).await?;
    info!(%namespace, session = %current.name_any(), %new_claim, "resumed volume scale-up");
    Ok(())
}

/// Name of the first claim-backed volume in the session template.
fn template_claim_name(current: &Session) -> Option<String> {
    current
        .spec
        .template
        .spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .find(|v| v.persistent_volume_claim.is_some())?
        .persistent_volume_claim
        .as_ref()
        .map(|source| source.claim_name.clone())
}

/// In-place expansion through the claim's storage class. `Ok(false)` means
/// the driver declines and the copy-job path takes over.
async fn expand_in_place(
    ctx: &Context,
    claims: &Api<PersistentVolumeClaim>,
    claim: &PersistentVolumeClaim,
    scaled: &Quantity,
) -> Result<bool> {
    let Some(class_name) = claim.spec.as_ref().and_then(|s| s.storage_class_name.clone()) else {
        return Ok(false);
    };
    let classes: Api<StorageClass> = Api::all(ctx.client.clone());
    let Some(class) = classes.get_opt(&class_name).await.map_err(Error::Kube)? else {
        return Ok(false);
    };
    if class.allow_volume_expansion != Some(true) {
        return Ok(false);
    }
    match claims
        .patch(
            &claim.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "spec": { "resources": { "requests": { "storage": scaled } } } })),
        )
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(response)) if response.code == 403 || response.code == 422 => Ok(false),
        Err(error) => Err(Error::Kube(error)),
    }
}

/// Rewrites the first claim-backed volume of the session template to point
/// at `claim_name`; the rewrite happens at the index of the match itself.
fn remounted_volumes(current: &Session, claim_name: &str) -> Result<Vec<Volume>> {
    let mut volumes = current
        .spec
        .template
        .spec
        .as_ref()
        .and_then(|s| s.volumes.clone())
        .unwrap_or_default();
    let index = volumes
        .iter()
        .position(|v| v.persistent_volume_claim.is_some())
        .ok_or(Error::MissingObjectKey(".spec.template.spec.volumes[].persistentVolumeClaim"))?;
    if let Some(source) = volumes[index].persistent_volume_claim.as_mut() {
        source.claim_name = claim_name.to_string();
    }
    Ok(volumes)
}

fn claim_mount(pod: &Pod) -> Option<(String, String, String)> {
    let spec = pod.spec.as_ref()?;
    let volume = spec
        .volumes
        .as_ref()?
        .iter()
        .find(|v| v.persistent_volume_claim.is_some())?;
    let claim_name = volume.persistent_volume_claim.as_ref()?.claim_name.clone();
    let container = spec.containers.first()?;
    let mount = container
        .volume_mounts
        .as_ref()?
        .iter()
        .find(|m| m.name == volume.name)?;
    Some((claim_name, mount.mount_path.clone(), container.name.clone()))
}

fn first_container_state(pod: &Pod) -> Option<&ContainerState> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .first()?
        .state
        .as_ref()
}

fn first_container_terminated(pod: &Pod) -> bool {
    first_container_state(pod)
        .map(|state| state.terminated.is_some())
        .unwrap_or(false)
}

/// Generator invariant violations are surfaced on the session and retried by
/// the next spec edit, not by backoff.
async fn fail_generation(ctx: &Context, current: &Session, error: Error) -> Result<Action> {
    warn!(session = %current.name_any(), %error, "session template rejected");
    publish(
        ctx,
        current,
        EventType::Warning,
        "FailedCreate",
        format!("Invalid session template: {error}"),
    )
    .await;
    Ok(Action::await_change())
}

/// Best-effort event publication; a failed event never aborts convergence.
async fn publish(ctx: &Context, current: &Session, type_: EventType, reason: &str, note: String) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: "Reconcile".to_string(),
        secondary: None,
    };
    if let Err(error) = ctx.recorder.publish(&event, &current.object_ref(&())).await {
        warn!(%error, "failed to publish event");
    }
}

fn session_of_pod(pod: Pod) -> Option<ObjectRef<Session>> {
    let namespace = pod.metadata.namespace.clone()?;
    let name = pod.labels().get(SESSION_NAME_LABEL)?.clone();
    Some(ObjectRef::new(&name).within(&namespace))
}

/// Registers the watch fabric and drains both trigger streams until
/// shutdown. Returns an error only when startup fails.
pub async fn run(state: State) -> Result<()> {
    let client = Client::try_default().await.map_err(Error::Kube)?;

    let sessions = Api::<Session>::all(client.clone());
    if let Err(error) = sessions.list(&ListParams::default().limit(1)).await {
        error!(%error, "Session CRD is not queryable; is it installed?");
        info!("Install it with: cargo run --bin crdgen | kubectl apply -f -");
        return Err(Error::Kube(error));
    }
    let ctx = state.to_context(client.clone());

    let session_controller = Controller::new(sessions, watcher::Config::default().any_semantic())
        .owns(Api::<StatefulSet>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .watches(Api::<Pod>::all(client.clone()), watcher::Config::default(), session_of_pod)
        .with_config(ControllerConfig::default().concurrency(1))
        .shutdown_on_signal()
        .run(reconcile_session, error_policy, ctx.clone())
        .filter_map(|result| async move { result.ok() })
        .for_each(|(reconciled, _)| async move { debug!(object = %reconciled, "reconciled") });

    let event_controller =
        Controller::new(Api::<ClusterEvent>::all(client.clone()), watcher::Config::default())
            .with_config(ControllerConfig::default().concurrency(1))
            .shutdown_on_signal()
            .run(reconcile_cluster_event, event_error_policy, ctx)
            .filter_map(|result| async move { result.ok() })
            .for_each(|_| futures::future::ready(()));

    info!("starting session controller");
    futures::join!(session_controller, event_controller);
    info!("controller terminated");
    Ok(())
}

// Scenario tests live against the mock API server in fixtures.rs.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{child_event, sample_session, Scenario, TestContext};
    use crate::session::LAST_ACTIVITY_ANNOTATION;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn fresh_session_materializes_workload_and_endpoint() {
        let TestContext { ctx, server } = TestContext::new();
        let session = sample_session("testsession", "testns");
        let handle = server.run(Scenario::FreshSession(session.clone()));

        let result = reconcile_session(Arc::new(session), ctx.clone()).await;
        assert!(result.is_ok(), "fresh session reconciles cleanly: {result:?}");
        assert_eq!(ctx.metrics.sessions_created.with_label_values(&["testns"]).get(), 1);
        crate::fixtures::timeout_after_1s(handle).await;
    }

    #[tokio::test]
    async fn idle_session_gets_the_stop_annotation() {
        let TestContext { ctx, server } = TestContext::new();
        let mut session = sample_session("testsession", "testns");
        session.metadata.annotations = Some(BTreeMap::from([(
            LAST_ACTIVITY_ANNOTATION.to_string(),
            "2020-01-01T00:00:00Z".to_string(),
        )]));
        let handle = server.run(Scenario::IdleSession(session.clone()));

        let result = reconcile_session(Arc::new(session), ctx.clone()).await;
        assert!(result.is_ok(), "idle session reconciles cleanly: {result:?}");
        assert_eq!(ctx.metrics.sessions_culled.with_label_values(&["testns"]).get(), 1);
        crate::fixtures::timeout_after_1s(handle).await;
    }

    #[tokio::test]
    async fn child_events_are_reissued_against_the_session() {
        let TestContext { ctx, server } = TestContext::new();
        let mut event = child_event(
            "testsession.18244ab2c3",
            "testns",
            "StatefulSet",
            "testsession",
            "FailedScheduling",
        );
        event.type_ = Some("Warning".to_string());
        event.message = Some("0/3 nodes are available".to_string());
        let handle = server.run(Scenario::ReissueEvent {
            event: event.clone(),
            session: sample_session("testsession", "testns"),
        });

        let result = reconcile_cluster_event(Arc::new(event), ctx).await;
        assert!(result.is_ok(), "event reissue succeeds: {result:?}");
        crate::fixtures::timeout_after_1s(handle).await;
    }

    #[tokio::test]
    async fn unrelated_events_are_dropped_without_api_traffic() {
        let TestContext { ctx, server } = TestContext::new();
        let event = child_event("ev", "testns", "ConfigMap", "other", "Updated");
        let handle = server.run(Scenario::RadioSilence);

        let result = reconcile_cluster_event(Arc::new(event), ctx).await;
        assert!(result.is_ok());
        crate::fixtures::timeout_after_1s(handle).await;
    }

    #[test]
    fn remount_rewrites_the_matched_volume_index() {
        let mut session = sample_session("s", "n");
        let pod_spec = session.spec.template.spec.as_mut().unwrap();
        pod_spec.volumes = Some(
            serde_json::from_value(serde_json::json!([
                { "name": "scratch", "emptyDir": {} },
                { "name": "home", "persistentVolumeClaim": { "claimName": "old-claim" } },
                { "name": "data", "persistentVolumeClaim": { "claimName": "other-claim" } },
            ]))
            .unwrap(),
        );

        let volumes = remounted_volumes(&session, "session-pvc-xyz").unwrap();
        assert_eq!(volumes[0].persistent_volume_claim, None);
        assert_eq!(
            volumes[1].persistent_volume_claim.as_ref().unwrap().claim_name,
            "session-pvc-xyz"
        );
        assert_eq!(
            volumes[2].persistent_volume_claim.as_ref().unwrap().claim_name,
            "other-claim",
            "only the first claim-backed volume is remounted"
        );
    }

    #[test]
    fn sessions_without_claim_backed_volumes_cannot_remount() {
        let session = sample_session("s", "n");
        assert!(remounted_volumes(&session, "new").is_err());
    }

    #[test]
    fn template_claim_resolution_finds_the_first_claim() {
        let mut session = sample_session("s", "n");
        assert_eq!(template_claim_name(&session), None);

        session.spec.template.spec.as_mut().unwrap().volumes = Some(
            serde_json::from_value(serde_json::json!([
                { "name": "scratch", "emptyDir": {} },
                { "name": "home", "persistentVolumeClaim": { "claimName": "old-claim" } },
            ]))
            .unwrap(),
        );
        assert_eq!(template_claim_name(&session).as_deref(), Some("old-claim"));
    }
}
