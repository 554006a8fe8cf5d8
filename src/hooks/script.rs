use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::patch::diff;
use super::{AdmissionHook, AdmissionResult};
use crate::packager::PackagedScript;
use crate::sandbox::Sandbox;
use crate::webhook::review::AdmissionRequest;

const DECISION_KEYS: [&str; 3] = ["allowed", "message", "object"];

const DEFAULT_DENY_MESSAGE: &str = "denied by capability";

/// Runs a packaged capability for each admission request.
///
/// The capability receives the request as a JSON string and may return:
///
/// - `null` (or nothing): allow unchanged;
/// - `{ allowed, message?, object? }`: an explicit decision, where `object`
///   is the mutated resource when allowing;
/// - anything else: the mutated resource.
///
/// Mutations are turned into a JSON Patch against `request.object`.
pub struct ScriptHook {
    name: String,
    sandbox: Arc<Sandbox>,
    script: Arc<PackagedScript>,
}

impl ScriptHook {
    pub fn new(name: impl Into<String>, sandbox: Arc<Sandbox>, script: Arc<PackagedScript>) -> Self {
        Self {
            name: name.into(),
            sandbox,
            script,
        }
    }
}

#[async_trait]
impl AdmissionHook for ScriptHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &AdmissionRequest) -> anyhow::Result<AdmissionResult> {
        let payload = serde_json::to_vec(request).context("cannot serialize admission request")?;
        let output = self
            .sandbox
            .run_blocking_task(Arc::clone(&self.script), payload)
            .await
            .inspect_err(|e| {
                warn!(
                    digest = %self.script.digest.short(),
                    operation = %request.operation,
                    kind = %request.kind.kind,
                    target = %request.target(),
                    "Capability failed: {e}"
                );
            })
            .with_context(|| format!("capability {} failed", self.script.digest.short()))?;

        let result = interpret(request.object.as_ref(), output);
        debug!(
            digest = %self.script.digest.short(),
            allowed = result.allowed(),
            "Capability produced {} patch operations",
            result.patch().len()
        );
        Ok(result)
    }
}

/// Maps a capability's return value onto an admission decision.
pub fn interpret(original: Option<&Value>, output: Value) -> AdmissionResult {
    let original = original.unwrap_or(&Value::Null);
    match output {
        Value::Null => AdmissionResult::allow(),
        Value::Object(fields) if is_decision(&fields) => decide(original, fields),
        mutated => AdmissionResult::allow_with_patch(diff(original, &mutated)),
    }
}

fn is_decision(fields: &Map<String, Value>) -> bool {
    fields.get("allowed").is_some_and(Value::is_boolean)
        && fields.keys().all(|key| DECISION_KEYS.contains(&key.as_str()))
}

fn decide(original: &Value, mut fields: Map<String, Value>) -> AdmissionResult {
    let message = fields
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string);

    if fields.get("allowed") != Some(&Value::Bool(true)) {
        return AdmissionResult::deny(message.unwrap_or_else(|| DEFAULT_DENY_MESSAGE.to_string()));
    }

    let result = match fields.remove("object") {
        Some(object) if !object.is_null() => AdmissionResult::allow_with_patch(diff(original, &object)),
        _ => AdmissionResult::allow(),
    };
    match message {
        Some(message) => result.with_message(message),
        None => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::PatchOperation;
    use crate::sandbox::{SandboxLimits, ScriptCache};
    use serde_json::json;

    fn pod() -> Value {
        json!({"metadata": {"name": "web", "labels": {"app": "web"}}})
    }

    // ── interpret ───────────────────────────────────────

    #[test]
    fn test_null_allows() {
        assert_eq!(interpret(Some(&pod()), Value::Null), AdmissionResult::allow());
    }

    #[test]
    fn test_mutated_object_is_diffed() {
        let mut mutated = pod();
        mutated["metadata"]["labels"]["team"] = json!("a");
        let result = interpret(Some(&pod()), mutated);
        assert!(result.allowed());
        assert_eq!(
            result.patch(),
            &[PatchOperation::add("/metadata/labels/team", json!("a"))]
        );
    }

    #[test]
    fn test_unchanged_object_has_empty_patch() {
        let result = interpret(Some(&pod()), pod());
        assert!(result.allowed());
        assert!(result.patch().is_empty());
    }

    #[test]
    fn test_deny_decision() {
        let result = interpret(Some(&pod()), json!({"allowed": false, "message": "no latest tags"}));
        assert!(!result.allowed());
        assert_eq!(result.message(), Some("no latest tags"));
        assert!(result.patch().is_empty());
    }

    #[test]
    fn test_deny_without_message_gets_default() {
        let result = interpret(None, json!({"allowed": false}));
        assert_eq!(result.message(), Some(DEFAULT_DENY_MESSAGE));
    }

    #[test]
    fn test_allow_decision_with_object() {
        let mut mutated = pod();
        mutated["metadata"]["labels"] = json!({});
        let result = interpret(
            Some(&pod()),
            json!({"allowed": true, "message": "labels cleared", "object": mutated}),
        );
        assert!(result.allowed());
        assert_eq!(result.message(), Some("labels cleared"));
        assert_eq!(result.patch(), &[PatchOperation::remove("/metadata/labels/app")]);
    }

    #[test]
    fn test_object_with_extra_keys_is_a_mutation() {
        // A resource that happens to have an `allowed` field is not a decision
        let result = interpret(None, json!({"allowed": true, "spec": {}}));
        assert!(result.allowed());
        assert_eq!(result.patch().len(), 1);
    }

    #[test]
    fn test_non_boolean_allowed_is_a_mutation() {
        let result = interpret(Some(&json!({})), json!({"allowed": "yes"}));
        assert!(result.allowed());
        assert_eq!(result.patch(), &[PatchOperation::add("/allowed", json!("yes"))]);
    }

    // ── ScriptHook ──────────────────────────────────────

    fn hook(code: &str) -> ScriptHook {
        let sandbox = Arc::new(Sandbox::new(SandboxLimits::default(), Arc::new(ScriptCache::new())));
        let script = Arc::new(PackagedScript::from_code(code.to_string()));
        ScriptHook::new("test", sandbox, script)
    }

    fn request() -> AdmissionRequest {
        serde_json::from_value(json!({
            "uid": "u1",
            "operation": "UPDATE",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "namespace": "team-a",
            "name": "web",
            "object": pod()
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_script_hook_labels_object() {
        let hook = hook(
            "globalThis.transform = function (p) { const r = JSON.parse(p); r.object.metadata.labels.ns = r.namespace; return r.object; };",
        );
        let result = hook.execute(&request()).await.unwrap();
        assert_eq!(
            result.patch(),
            &[PatchOperation::add("/metadata/labels/ns", json!("team-a"))]
        );
    }

    #[tokio::test]
    async fn test_script_hook_error_propagates() {
        let hook = hook("globalThis.transform = function () { throw new Error('bad'); };");
        let err = hook.execute(&request()).await.unwrap_err();
        assert!(err.to_string().contains("failed"));
    }
}
