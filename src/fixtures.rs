//! Shared test fixtures: sample objects and a scenario-scripted mock API
//! server. Each scenario scripts the exact request sequence a reconcile is
//! expected to make; an unhandled request shows up as a closed-service error
//! in the test, a missing one as a scenario timeout.

use std::sync::Arc;

use http::{Request, Response};
use k8s_openapi::api::core::v1::{Event as ClusterEvent, PersistentVolumeClaim, Pod};
use kube::{client::Body, runtime::events::Recorder, Client, ResourceExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use crate::{
    config::Settings,
    controller::{Context, Diagnostics, CONTROLLER_NAME},
    metrics::Metrics,
    session::{Session, SessionSpec, STOP_ANNOTATION},
};

pub fn sample_session(name: &str, namespace: &str) -> Session {
    let template = serde_json::from_value(json!({
        "spec": {
            "containers": [{
                "name": "session",
                "image": "img",
                "ports": [{ "containerPort": 8888 }],
            }],
        },
    }))
    .unwrap();
    let mut session = Session::new(name, SessionSpec { template, scale_pvc: None });
    session.metadata.namespace = Some(namespace.to_string());
    session.metadata.uid = Some("c2f47fbd-ae40-4046-a807-0a1b2c3d4e5f".to_string());
    session
}

pub fn claim_with_storage(name: &str, namespace: &str, storage: &str) -> PersistentVolumeClaim {
    serde_json::from_value(json!({
        "metadata": { "name": name, "namespace": namespace },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "storageClassName": "standard",
            "resources": { "requests": { "storage": storage } },
        },
    }))
    .unwrap()
}

pub fn child_event(
    name: &str,
    namespace: &str,
    kind: &str,
    involved_name: &str,
    reason: &str,
) -> ClusterEvent {
    serde_json::from_value(json!({
        "metadata": { "name": name, "namespace": namespace },
        "involvedObject": { "kind": kind, "name": involved_name, "namespace": namespace },
        "reason": reason,
        "type": "Normal",
    }))
    .unwrap()
}

fn sample_pod(name: &str, namespace: &str) -> Pod {
    serde_json::from_value(json!({
        "metadata": { "name": format!("{name}-0"), "namespace": namespace },
        "spec": { "containers": [{ "name": "session", "image": "img" }] },
    }))
    .unwrap()
}

// ------------------------------------------------------------------------
// mock API server
// ------------------------------------------------------------------------

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

pub struct ApiServerVerifier(ApiServerHandle);

pub struct TestContext {
    pub ctx: Arc<Context>,
    pub server: ApiServerVerifier,
}

impl TestContext {
    pub fn new() -> Self {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let ctx = Arc::new(Context {
            client: client.clone(),
            settings: Settings::default(),
            metrics: Metrics::default(),
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            recorder: Recorder::new(client, CONTROLLER_NAME.into()),
            sync: Arc::new(Mutex::new(())),
        });
        TestContext { ctx, server: ApiServerVerifier(handle) }
    }
}

/// Scenarios the mock API server can play through.
pub enum Scenario {
    /// No children exist yet; workload and endpoint get created.
    FreshSession(Session),
    /// Children converged, pod alive, activity stale; the culler fires.
    IdleSession(Session),
    /// A child event is read back and re-recorded against its session.
    ReissueEvent { event: ClusterEvent, session: Session },
    /// No API traffic is expected at all.
    RadioSilence,
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

impl ApiServerVerifier {
    /// Runs the scenario to completion in the background. Await the returned
    /// handle (with a timeout) to ensure every scripted call happened.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match scenario {
                Scenario::FreshSession(session) => self.handle_fresh_session(session).await,
                Scenario::IdleSession(session) => self.handle_idle_session(session).await,
                Scenario::ReissueEvent { event, session } => {
                    self.handle_reissue(event, session).await
                }
                Scenario::RadioSilence => Ok(self),
            }
            .expect("scenario completed without errors");
        })
    }

    async fn handle_fresh_session(self, session: Session) -> anyhow::Result<Self> {
        let name = session.name_any();
        let ns = session.namespace().unwrap();
        self.get_not_found(&format!("/api/v1/namespaces/{ns}/events/{name}"))
            .await?
            .get_returns(
                &format!("/apis/sessions.example.org/v1beta1/namespaces/{ns}/sessions/{name}"),
                &session,
            )
            .await?
            .get_not_found(&format!("/apis/apps/v1/namespaces/{ns}/statefulsets/{name}"))
            .await?
            .create_echoes(&format!("/apis/apps/v1/namespaces/{ns}/statefulsets"), |body| {
                assert_eq!(body["spec"]["replicas"], 1);
                assert_eq!(body["spec"]["serviceName"], body["metadata"]["name"]);
                let container = &body["spec"]["template"]["spec"]["containers"][0];
                assert_eq!(container["workingDir"], "/home/jovyan");
                let env = container["env"].as_array().expect("env is populated");
                assert!(env
                    .iter()
                    .any(|e| e["name"] == "NB_PREFIX" && e["value"] == "/session/testns/testsession"));
                assert_eq!(
                    body["spec"]["template"]["spec"]["securityContext"]["fsGroup"],
                    100
                );
            })
            .await?
            .get_not_found(&format!("/api/v1/namespaces/{ns}/services/{name}"))
            .await?
            .create_echoes(&format!("/api/v1/namespaces/{ns}/services"), |body| {
                assert_eq!(body["spec"]["ports"][0]["port"], 80);
                assert_eq!(body["spec"]["ports"][0]["targetPort"], 8888);
            })
            .await?
            .get_not_found(&format!("/api/v1/namespaces/{ns}/pods/{name}-0"))
            .await
    }

    async fn handle_idle_session(self, session: Session) -> anyhow::Result<Self> {
        let name = session.name_any();
        let ns = session.namespace().unwrap();
        let settings = Settings::default();
        let workload = crate::resources::statefulset(&session, &settings).unwrap();
        let endpoint = crate::resources::service(&session).unwrap();
        let pod = sample_pod(&name, &ns);

        self.get_not_found(&format!("/api/v1/namespaces/{ns}/events/{name}"))
            .await?
            .get_returns(
                &format!("/apis/sessions.example.org/v1beta1/namespaces/{ns}/sessions/{name}"),
                &session,
            )
            .await?
            .get_returns(&format!("/apis/apps/v1/namespaces/{ns}/statefulsets/{name}"), &workload)
            .await?
            .get_returns(&format!("/api/v1/namespaces/{ns}/services/{name}"), &endpoint)
            .await?
            .get_returns(&format!("/api/v1/namespaces/{ns}/pods/{name}-0"), &pod)
            .await?
            .patch_echoes(
                &format!("/apis/sessions.example.org/v1beta1/namespaces/{ns}/sessions/{name}"),
                &session,
                |body| {
                    assert!(
                        body["metadata"]["annotations"][STOP_ANNOTATION].is_string(),
                        "culling writes the stop annotation: {body}"
                    );
                },
            )
            .await
    }

    async fn handle_reissue(self, event: ClusterEvent, session: Session) -> anyhow::Result<Self> {
        let event_name = event.name_any();
        let session_name = session.name_any();
        let ns = session.namespace().unwrap();
        self.get_returns(&format!("/api/v1/namespaces/{ns}/events/{event_name}"), &event)
            .await?
            .get_returns(
                &format!("/apis/sessions.example.org/v1beta1/namespaces/{ns}/sessions/{session_name}"),
                &session,
            )
            .await?
            .create_echoes(&format!("/apis/events.k8s.io/v1/namespaces/{ns}/events"), |body| {
                assert_eq!(body["reason"], "FailedScheduling");
                assert_eq!(body["type"], "Warning");
                let note = body["note"].as_str().expect("note is recorded");
                assert!(
                    note.starts_with("Reissued from statefulset/testsession:"),
                    "unexpected note {note:?}"
                );
            })
            .await
    }

    // scripted exchanges

    async fn get_not_found(mut self, path: &str) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), path);
        let status = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{path} not found"),
            "reason": "NotFound",
            "code": 404,
        });
        send.send_response(
            Response::builder()
                .status(404)
                .body(Body::from(serde_json::to_vec(&status)?))
                .unwrap(),
        );
        Ok(self)
    }

    async fn get_returns<T: Serialize>(mut self, path: &str, object: &T) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), path);
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(object)?))
                .unwrap(),
        );
        Ok(self)
    }

    async fn create_echoes(
        mut self,
        path: &str,
        verify: impl FnOnce(&Value),
    ) -> anyhow::Result<Self> {
        use http_body_util::BodyExt;
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.uri().path(), path);
        let bytes = request.into_body().collect().await.expect("request body").to_bytes();
        let body: Value = serde_json::from_slice(&bytes)?;
        verify(&body);
        send.send_response(Response::builder().body(Body::from(bytes.to_vec())).unwrap());
        Ok(self)
    }

    async fn patch_echoes<T: Serialize>(
        mut self,
        path: &str,
        respond_with: &T,
        verify: impl FnOnce(&Value),
    ) -> anyhow::Result<Self> {
        use http_body_util::BodyExt;
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(request.uri().path(), path);
        let bytes = request.into_body().collect().await.expect("request body").to_bytes();
        let body: Value = serde_json::from_slice(&bytes)?;
        verify(&body);
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(respond_with)?))
                .unwrap(),
        );
        Ok(self)
    }
}
