//! Local health endpoint.
//!
//! The payload reflects process liveness only. It never consults the
//! registry, so an unreachable discovery service does not make the instance
//! report itself unhealthy.

use crate::router::{HandlerFn, Request, Response, json};
use futures_util::future::BoxFuture;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Status string served while the process is alive.
pub const HEALTHY: &str = "Healthy";

/// Body of the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthPayload {
    pub status: String,
    pub service: String,
    pub id: String,
}

impl HealthPayload {
    pub fn healthy(service: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            status: HEALTHY.to_string(),
            service: service.into(),
            id: id.into(),
        }
    }
}

/// Render the health response for an instance.
pub fn health_response(payload: &HealthPayload) -> Response {
    json(StatusCode::OK, payload)
}

/// Handler answering every call with the same healthy payload.
pub(crate) fn health_handler(payload: HealthPayload) -> HandlerFn {
    let payload = Arc::new(payload);
    Arc::new(move |_req: Request| -> BoxFuture<'static, Response> {
        let payload = payload.clone();
        Box::pin(async move { health_response(&payload) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri, header};
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_health_handler_payload() {
        let handler = health_handler(HealthPayload::healthy("orders", "orders-1"));

        let response = handler(Request::new(Method::GET, Uri::from_static("/health"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let payload: HealthPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload, HealthPayload::healthy("orders", "orders-1"));
        assert_eq!(payload.status, "Healthy");
    }

    #[test]
    fn test_payload_field_names() {
        let value = serde_json::to_value(HealthPayload::healthy("svc", "svc-42")).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "status": "Healthy", "service": "svc", "id": "svc-42" })
        );
    }
}
