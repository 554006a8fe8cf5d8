//! Admission webhook server.
//!
//! ```text
//! /
//! ├── /mutate    - AdmissionReview in, AdmissionReview out (POST only)
//! └── /healthz   - liveness probe
//! ```

pub mod error;
pub mod handler;
pub mod review;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use crate::hooks::HookTable;

/// An UPDATE review carries `object` and `oldObject`, each up to the
/// 1.5 MiB etcd object limit, plus the envelope.
pub const MAX_REVIEW_BYTES: usize = 6 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub hooks: Arc<HookTable>,
}

impl AppState {
    pub fn new(hooks: HookTable) -> Self {
        Self {
            hooks: Arc::new(hooks),
        }
    }
}

/// `/mutate` accepts every method so that non-POST requests get the
/// protocol's own 405 body rather than axum's.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/mutate", any(handler::mutate))
        .route("/healthz", get(handler::healthz))
        .layer(DefaultBodyLimit::max(MAX_REVIEW_BYTES))
        .with_state(state)
}

/// Serves until SIGINT or SIGTERM, then drains in-flight requests.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Webhook server stopped");
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{AdmissionHook, AdmissionResult, PatchOperation, ScriptHook};
    use crate::packager::PackagedScript;
    use crate::sandbox::{Sandbox, SandboxLimits, ScriptCache};
    use crate::webhook::review::{AdmissionRequest, Operation};
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use reqwest::StatusCode;
    use serde_json::{json, Value};

    struct Fixed(AdmissionResult);

    #[async_trait]
    impl AdmissionHook for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn execute(&self, _request: &AdmissionRequest) -> anyhow::Result<AdmissionResult> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl AdmissionHook for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn execute(&self, _request: &AdmissionRequest) -> anyhow::Result<AdmissionResult> {
            anyhow::bail!("capability exploded")
        }
    }

    /// Serves `hooks` on an ephemeral port and returns the base URL.
    async fn spawn(hooks: HookTable) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = build_router(AppState::new(hooks));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn spawn_with(operation: Operation, hook: Arc<dyn AdmissionHook>) -> String {
        let mut hooks = HookTable::new();
        hooks.bind(operation, hook).unwrap();
        spawn(hooks).await
    }

    fn review(operation: &str) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "7f0b2891-916f-4ed6-b7cd-27bff1815a8c",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "namespace": "team-a",
                "name": "web",
                "operation": operation,
                "object": {"metadata": {"name": "web", "labels": {"app": "web"}}}
            }
        })
    }

    async fn post_raw(base: &str, content_type: &str, body: String) -> (StatusCode, String) {
        let response = reqwest::Client::new()
            .post(format!("{base}/mutate"))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.text().await.unwrap())
    }

    async fn post(base: &str, body: &Value) -> (StatusCode, Value) {
        let (status, text) = post_raw(base, "application/json", body.to_string()).await;
        (status, serde_json::from_str(&text).unwrap())
    }

    fn decode_patch(response: &Value) -> Value {
        let patch = STANDARD.decode(response["response"]["patch"].as_str().unwrap()).unwrap();
        serde_json::from_slice(&patch).unwrap()
    }

    // ── Transport preconditions ─────────────────────────

    #[tokio::test]
    async fn test_get_is_method_not_allowed() {
        let base = spawn(HookTable::new()).await;
        let response = reqwest::get(format!("{base}/mutate")).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.text().await.unwrap(),
            "invalid method: only POST requests are allowed"
        );
    }

    #[tokio::test]
    async fn test_non_json_content_type_is_bad_request() {
        let base = spawn(HookTable::new()).await;
        let (status, body) = post_raw(&base, "text/plain", review("UPDATE").to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "only content type 'application/json' is supported");
    }

    #[tokio::test]
    async fn test_charset_parameter_is_accepted() {
        let base = spawn(HookTable::new()).await;
        let (status, _) = post_raw(&base, "application/json; charset=utf-8", review("UPDATE").to_string()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_garbage_body_is_bad_request() {
        let base = spawn(HookTable::new()).await;
        let (status, body) = post_raw(&base, "application/json", "{not json".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.starts_with("could not deserialize request: "));
    }

    #[tokio::test]
    async fn test_missing_request_is_bad_request() {
        let base = spawn(HookTable::new()).await;
        let (status, body) = post_raw(&base, "application/json", json!({"kind": "AdmissionReview"}).to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "malformed admission review: request is nil");
    }

    // ── Dispatch ────────────────────────────────────────

    #[tokio::test]
    async fn test_update_with_noop_hook_allows_without_patch() {
        let base = spawn_with(Operation::Update, Arc::new(Fixed(AdmissionResult::allow()))).await;
        let (status, body) = post(&base, &review("UPDATE")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(body["kind"], "AdmissionReview");
        assert_eq!(body["response"]["uid"], "7f0b2891-916f-4ed6-b7cd-27bff1815a8c");
        assert_eq!(body["response"]["allowed"], true);
        assert!(body["response"].get("patch").is_none());
        assert!(body["response"].get("patchType").is_none());
    }

    #[tokio::test]
    async fn test_connect_is_allowed_unbound() {
        let base = spawn_with(Operation::Update, Arc::new(Fixed(AdmissionResult::deny("x")))).await;
        let (status, body) = post(&base, &review("CONNECT")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["allowed"], true);
        assert!(body["response"].get("patch").is_none());
    }

    #[tokio::test]
    async fn test_unknown_operation_is_allowed() {
        let base = spawn_with(Operation::Update, Arc::new(Fixed(AdmissionResult::deny("x")))).await;
        let (_, body) = post(&base, &review("PATCH")).await;
        assert_eq!(body["response"]["allowed"], true);
    }

    #[tokio::test]
    async fn test_deny_hook_response_has_no_patch() {
        let base = spawn_with(Operation::Create, Arc::new(Fixed(AdmissionResult::deny("pods are frozen")))).await;
        let (status, body) = post(&base, &review("CREATE")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["allowed"], false);
        assert_eq!(body["response"]["status"]["message"], "pods are frozen");
        assert!(body["response"].get("patch").is_none());
    }

    #[tokio::test]
    async fn test_patch_is_base64_json_patch() {
        let ops = vec![PatchOperation::add("/metadata/labels/team", json!("a"))];
        let base = spawn_with(Operation::Update, Arc::new(Fixed(AdmissionResult::allow_with_patch(ops)))).await;
        let (_, body) = post(&base, &review("UPDATE")).await;
        assert_eq!(body["response"]["patchType"], "JSONPatch");
        assert_eq!(
            decode_patch(&body),
            json!([{"op": "add", "path": "/metadata/labels/team", "value": "a"}])
        );
    }

    #[tokio::test]
    async fn test_hook_failure_is_internal_error() {
        let base = spawn_with(Operation::Update, Arc::new(Failing)).await;
        let (status, body) = post_raw(&base, "application/json", review("UPDATE").to_string()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "admission hook failed");
    }

    #[tokio::test]
    async fn test_script_hook_end_to_end() {
        let sandbox = Arc::new(Sandbox::new(SandboxLimits::default(), Arc::new(ScriptCache::new())));
        let script = Arc::new(PackagedScript::from_code(
            "globalThis.transform = function (p) { const o = JSON.parse(p).object; o.metadata.labels.managed = 'capgate'; return o; };"
                .to_string(),
        ));
        let base = spawn_with(Operation::Update, Arc::new(ScriptHook::new("label", sandbox, script))).await;
        let (status, body) = post(&base, &review("UPDATE")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            decode_patch(&body),
            json!([{"op": "add", "path": "/metadata/labels/managed", "value": "capgate"}])
        );
    }

    #[tokio::test]
    async fn test_script_timeout_is_internal_error() {
        let limits = SandboxLimits {
            timeout: std::time::Duration::from_millis(100),
            ..SandboxLimits::default()
        };
        let sandbox = Arc::new(Sandbox::new(limits, Arc::new(ScriptCache::new())));
        let script = Arc::new(PackagedScript::from_code(
            "globalThis.transform = function () { while (true) {} };".to_string(),
        ));
        let base = spawn_with(Operation::Update, Arc::new(ScriptHook::new("spin", sandbox, script))).await;
        let (status, _) = post_raw(&base, "application/json", review("UPDATE").to_string()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_large_update_review_is_accepted() {
        let base = spawn_with(Operation::Update, Arc::new(Fixed(AdmissionResult::allow()))).await;
        let blob = "x".repeat(1_400_000);
        let mut body = review("UPDATE");
        body["request"]["object"]["data"] = json!({"blob": blob});
        body["request"]["oldObject"] = json!({"metadata": {"name": "web"}, "data": {"blob": blob}});
        let encoded = body.to_string();
        assert!(encoded.len() > 2_800_000);

        let (status, text) = post_raw(&base, "application/json", encoded).await;
        assert_eq!(status, StatusCode::OK);
        let response: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(response["response"]["allowed"], true);
    }

    // ── Health ──────────────────────────────────────────

    #[tokio::test]
    async fn test_healthz() {
        let base = spawn(HookTable::new()).await;
        let response = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }
}
