//! `/mutate` and `/healthz` handlers.
//!
//! A request moves through `Received → Decoded → Dispatched → ResultBuilt →
//! Responded`; any precondition or decode failure ends it as `Rejected`
//! with a fixed `ProtocolError` body.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, error, info};

use super::error::ProtocolError;
use super::review::{
    AdmissionRequest, AdmissionResponse, AdmissionReviewRequest, AdmissionReviewResponse, Status,
    PATCH_TYPE_JSON_PATCH,
};
use super::AppState;
use crate::hooks::AdmissionResult;

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn mutate(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProtocolError> {
    debug!("Admission request received ({} bytes)", body.len());

    let request = decode(&method, &headers, &body).inspect_err(|e| {
        debug!("Admission request rejected: {e}");
    })?;
    debug!(uid = %request.uid, operation = %request.operation, "Admission request decoded");

    let result = state.hooks.dispatch(&request).await.map_err(|e| {
        error!(
            uid = %request.uid,
            operation = %request.operation,
            kind = %request.kind.kind,
            target = %request.target(),
            "Admission hook failed: {e:#}"
        );
        ProtocolError::HookFailed
    })?;
    debug!(uid = %request.uid, "Admission request dispatched");

    let review = build_review(&request, &result)?;
    debug!(uid = %request.uid, "Admission result built");

    let body = serde_json::to_vec(&review).map_err(|e| {
        error!(uid = %request.uid, "Cannot serialize admission response: {e}");
        ProtocolError::ResponseSerialization
    })?;

    info!(
        operation = %request.operation,
        kind = %request.kind.kind,
        target = %request.target(),
        allowed = result.allowed(),
        patch_ops = result.patch().len(),
        "Admission request responded"
    );
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

/// Transport preconditions and envelope decoding.
fn decode(method: &Method, headers: &HeaderMap, body: &[u8]) -> Result<AdmissionRequest, ProtocolError> {
    if method != Method::POST {
        return Err(ProtocolError::InvalidMethod);
    }
    if !is_json(headers) {
        return Err(ProtocolError::InvalidContentType);
    }
    let review: AdmissionReviewRequest =
        serde_json::from_slice(body).map_err(|e| ProtocolError::Deserialize(e.to_string()))?;
    debug!(api_version = ?review.api_version, kind = ?review.kind, "Admission review envelope decoded");
    review.request.ok_or(ProtocolError::MissingRequest)
}

/// Media type essence is `application/json`; parameters are ignored.
fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
}

fn build_review(request: &AdmissionRequest, result: &AdmissionResult) -> Result<AdmissionReviewResponse, ProtocolError> {
    let mut response = AdmissionResponse {
        uid: request.uid.clone(),
        allowed: result.allowed(),
        status: result.message().map(|message| Status {
            message: message.to_string(),
        }),
        patch: None,
        patch_type: None,
    };

    if result.allowed() && !result.patch().is_empty() {
        let patch = serde_json::to_vec(result.patch()).map_err(|e| {
            error!(uid = %request.uid, "Cannot serialize JSON patch: {e}");
            ProtocolError::PatchSerialization
        })?;
        response.patch = Some(STANDARD.encode(patch));
        response.patch_type = Some(PATCH_TYPE_JSON_PATCH);
    }

    Ok(AdmissionReviewResponse::new(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::PatchOperation;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn json_headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(value));
        headers
    }

    fn request() -> AdmissionRequest {
        serde_json::from_value(json!({"uid": "abc", "operation": "UPDATE"})).unwrap()
    }

    #[test]
    fn test_content_type_parameters_ignored() {
        assert!(is_json(&json_headers("application/json")));
        assert!(is_json(&json_headers("application/json; charset=utf-8")));
        assert!(!is_json(&json_headers("text/plain")));
        assert!(!is_json(&HeaderMap::new()));
    }

    #[test]
    fn test_decode_rejections() {
        let headers = json_headers("application/json");
        assert!(matches!(
            decode(&Method::GET, &headers, b"{}"),
            Err(ProtocolError::InvalidMethod)
        ));
        assert!(matches!(
            decode(&Method::POST, &headers, b"not json"),
            Err(ProtocolError::Deserialize(_))
        ));
        assert!(matches!(
            decode(&Method::POST, &headers, b"{}"),
            Err(ProtocolError::MissingRequest)
        ));
    }

    #[test]
    fn test_patch_encoded_when_allowed() {
        let result = AdmissionResult::allow_with_patch(vec![PatchOperation::add("/a", json!(1))]);
        let review = build_review(&request(), &result).unwrap();
        let patch = STANDARD.decode(review.response.patch.unwrap()).unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&patch).unwrap(),
            json!([{"op": "add", "path": "/a", "value": 1}])
        );
        assert_eq!(review.response.patch_type, Some("JSONPatch"));
        assert_eq!(review.response.uid, "abc");
    }

    #[test]
    fn test_deny_has_status_and_no_patch() {
        let review = build_review(&request(), &AdmissionResult::deny("nope")).unwrap();
        assert!(!review.response.allowed);
        assert!(review.response.patch.is_none());
        assert!(review.response.patch_type.is_none());
        assert_eq!(review.response.status.unwrap().message, "nope");
    }
}
