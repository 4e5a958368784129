mod next;
mod sequences;

use std::sync::Arc;

use axum::Router;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use openerp_core::{Caller, ServiceError};

use crate::service::SequenceService;

type ServiceState = Arc<SequenceService>;

/// Build the sequence module router.
///
/// Routes:
/// - `POST   /v1/sequences`              create sequence
/// - `GET    /v1/sequences`              list sequences
/// - `GET    /v1/sequences/{id}`         get sequence
/// - `PATCH  /v1/sequences/{id}`         merge-patch sequence
/// - `DELETE /v1/sequences/{id}`         delete sequence
/// - `GET    /v1/sequences/{id}/ranges`  list date ranges
/// - `POST   /v1/sequences/{id}/ranges`  create date range
/// - `PATCH  /v1/ranges/{id}`            merge-patch date range
/// - `DELETE /v1/ranges/{id}`            delete date range
/// - `POST   /v1/sequences/{id}/next`    draw by id
/// - `POST   /v1/codes/{code}/next`      draw by code
pub fn router(service: Arc<SequenceService>) -> Router {
    let v1 = Router::new()
        .merge(sequences::routes())
        .merge(next::routes());
    Router::new().nest("/v1", v1).with_state(service)
}

/// The authenticated caller, placed in the request extensions by the
/// server's auth layer after it verified the bearer token.
#[derive(Debug, Clone)]
pub struct CurrentCaller(pub Caller);

impl<S: Send + Sync> FromRequestParts<S> for CurrentCaller {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Caller>()
            .cloned()
            .map(CurrentCaller)
            .ok_or_else(|| ServiceError::Unauthorized("no authenticated caller".into()))
    }
}

/// Run a service call that may wait on row locks off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServiceError::Internal(format!("blocking task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use openerp_core::PermissionChecker;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::service::testing::service_with;

    fn app() -> Router {
        router(Arc::new(service_with(
            Arc::new(PermissionChecker),
            Duration::from_millis(100),
        )))
    }

    async fn call(app: &Router, method: &str, uri: &str, perms: &str, body: Option<Value>) -> (StatusCode, Value) {
        let caller = Caller::new("u1")
            .with_company(1)
            .with_permissions(perms.split(',').map(str::trim));
        let mut req = Request::builder().method(method).uri(uri).extension(caller);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    const ADMIN: &str = "base:sequence:read, base:sequence:write";

    #[tokio::test]
    async fn configure_and_draw_over_http() {
        let app = app();
        let (status, seq) = call(
            &app,
            "POST",
            "/v1/sequences",
            ADMIN,
            Some(json!({
                "name": "Customer Invoices",
                "code": "account.invoice",
                "implementation": "no_gap",
                "prefix": "INV/%(year)s/",
                "padding": 4,
                "companyId": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = seq["id"].as_i64().unwrap();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/sequences/{id}/next"),
            "base:sequence:read",
            Some(json!({"date": "2024-03-01"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"value": "INV/2024/0001"}));

        let (status, body) = call(
            &app,
            "POST",
            "/v1/codes/account.invoice/next",
            "base:sequence:read",
            Some(json!({"date": "2024-03-01"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], "INV/2024/0002");

        let (_, body) = call(&app, "POST", "/v1/codes/missing/next", ADMIN, Some(json!({}))).await;
        assert_eq!(body, json!({"value": null}));

        let (status, body) = call(&app, "GET", &format!("/v1/sequences/{id}"), ADMIN, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["numberNextActual"], 3);
    }

    #[tokio::test]
    async fn errors_use_stable_codes() {
        let app = app();
        let (status, body) = call(&app, "GET", "/v1/sequences/9", ADMIN, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");

        let (status, body) = call(
            &app,
            "POST",
            "/v1/sequences",
            "base:sequence:read",
            Some(json!({"name": "X"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "PERMISSION_DENIED");

        let (status, body) = call(
            &app,
            "POST",
            "/v1/sequences",
            ADMIN,
            Some(json!({"name": "X", "numberIncrement": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Step must not be zero.");

        let req = Request::builder()
            .uri("/v1/sequences")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
