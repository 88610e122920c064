//! Model policy gate.
//!
//! Runs before any network call. A write request whose `model` contains the
//! disallowed marker is answered locally with a fixed 403.

use crate::core::config::PolicyConfig;
use crate::core::metrics::get_metrics;
use crate::proxy::translate::{ProxyBody, ProxyRequest};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    /// Disallowed model requested; carries the model name as sent
    Reject { model: String },
}

#[derive(Debug, Clone, Default)]
pub struct ModelPolicy {
    disabled_model: Option<String>,
}

impl ModelPolicy {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            disabled_model: config.disabled_model.clone().filter(|m| !m.is_empty()),
        }
    }

    /// Marker that makes a model disallowed, when the gate is on.
    pub fn marker(&self) -> Option<&str> {
        self.disabled_model.as_deref()
    }

    /// Decide whether `request` may be forwarded.
    ///
    /// Fails open: anything that cannot be inspected is allowed.
    pub fn check(&self, request: &ProxyRequest) -> PolicyDecision {
        let Some(marker) = self.disabled_model.as_deref() else {
            return PolicyDecision::Allow;
        };
        if !request.is_write() {
            return PolicyDecision::Allow;
        }

        let model = match &request.body {
            ProxyBody::Json(body) => match body.get("model") {
                Some(Value::String(model)) => model,
                Some(other) => {
                    tracing::warn!(model = %other, "Model field is not a string, skipping policy check");
                    return PolicyDecision::Allow;
                }
                None => return PolicyDecision::Allow,
            },
            ProxyBody::Raw(_) => {
                tracing::warn!("Request body is not JSON, skipping policy check");
                return PolicyDecision::Allow;
            }
            ProxyBody::Stream(_) | ProxyBody::Empty => return PolicyDecision::Allow,
        };

        if model.contains(marker) {
            PolicyDecision::Reject {
                model: model.clone(),
            }
        } else {
            PolicyDecision::Allow
        }
    }

    /// Fixed rejection answer for this gate's marker.
    pub fn rejection(&self, model: &str) -> Response {
        let marker = self.marker().unwrap_or(model);
        tracing::warn!(model = %model, marker = %marker, "Rejected request for disallowed model");
        get_metrics()
            .policy_rejections
            .with_label_values(&[marker])
            .inc();
        rejection_response(marker)
    }
}

/// 403 with `{"error": true, "message": "you are not allowed to use <marker> model"}`.
pub fn rejection_response(marker: &str) -> Response {
    let body = json!({
        "error": true,
        "message": format!("you are not allowed to use {} model", marker),
    });
    (StatusCode::FORBIDDEN, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, Bytes};
    use axum::http::Method;
    use pretty_assertions::assert_eq;

    fn gate() -> ModelPolicy {
        ModelPolicy::new(&PolicyConfig {
            disabled_model: Some("gpt-4".to_string()),
        })
    }

    fn post(body: ProxyBody) -> ProxyRequest {
        ProxyRequest {
            method: Method::POST,
            path_and_query: "/api/openai/v1/chat/completions".to_string(),
            authorization: None,
            body,
        }
    }

    #[test]
    fn test_rejects_marker_substring() {
        let request = post(ProxyBody::Json(json!({"model": "gpt-4-0613"})));
        assert_eq!(
            gate().check(&request),
            PolicyDecision::Reject {
                model: "gpt-4-0613".to_string()
            }
        );
    }

    #[test]
    fn test_allows_other_models() {
        let request = post(ProxyBody::Json(json!({"model": "gpt-3.5-turbo"})));
        assert_eq!(gate().check(&request), PolicyDecision::Allow);
    }

    #[test]
    fn test_disabled_gate_allows_everything() {
        let policy = ModelPolicy::new(&PolicyConfig::default());
        assert!(policy.marker().is_none());
        let request = post(ProxyBody::Json(json!({"model": "gpt-4"})));
        assert_eq!(policy.check(&request), PolicyDecision::Allow);
    }

    #[test]
    fn test_fails_open_on_uninspectable_bodies() {
        let policy = gate();
        assert_eq!(
            policy.check(&post(ProxyBody::Raw(Bytes::from_static(b"{broken")))),
            PolicyDecision::Allow
        );
        assert_eq!(policy.check(&post(ProxyBody::Empty)), PolicyDecision::Allow);
        assert_eq!(
            policy.check(&post(ProxyBody::Json(json!({"model": 4})))),
            PolicyDecision::Allow
        );
        assert_eq!(
            policy.check(&post(ProxyBody::Json(json!(["gpt-4"])))),
            PolicyDecision::Allow
        );
    }

    #[test]
    fn test_non_write_methods_are_not_checked() {
        let request = ProxyRequest {
            method: Method::GET,
            path_and_query: "/api/openai/v1/models/gpt-4".to_string(),
            authorization: None,
            body: ProxyBody::Stream(Body::from("{\"model\":\"gpt-4\"}")),
        };
        assert_eq!(gate().check(&request), PolicyDecision::Allow);
    }

    #[tokio::test]
    async fn test_rejection_response_body() {
        let response = rejection_response("gpt-4");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            json!({"error": true, "message": "you are not allowed to use gpt-4 model"})
        );
    }
}
