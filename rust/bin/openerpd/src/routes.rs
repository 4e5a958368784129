//! Route registration: module routes plus system endpoints.

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;

use crate::auth_middleware::{self, JwtState};

/// Build the complete router, mounting each module under `/{name}`.
/// Everything but `/health` and `/version` requires a valid JWT.
pub fn build_router(module_routes: Vec<(&str, Router)>, jwt_state: Arc<JwtState>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/version", get(version));

    for (name, router) in module_routes {
        app = app.nest(&format!("/{name}"), router);
    }
    app.layer(middleware::from_fn_with_state(
        jwt_state,
        auth_middleware::auth_middleware,
    ))
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
    }))
}

async fn version() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "name": "openerpd",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use openerp_core::{Authenticator, Module, PermissionChecker};
    use sequence::SequenceModule;
    use sequence::service::SequenceSettings;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::auth_middleware::Claims;

    const SECRET: &str = "routes-test-secret";

    fn app(auth: Arc<dyn Authenticator>) -> Router {
        let module = SequenceModule::new(
            Arc::new(openerp_sql::SqliteStore::open_in_memory().unwrap()),
            Arc::new(openerp_kv::RedbStore::open_in_memory().unwrap()),
            auth,
            SequenceSettings::default(),
        )
        .unwrap();
        build_router(
            vec![(module.name(), module.routes())],
            Arc::new(JwtState::from_secret(SECRET)),
        )
    }

    fn sign(secret: &str, sub: &str, permissions: &[&str], expire_secs: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            company_id: Some(1),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            iat: now,
            exp: now + expire_secs,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn create_request(token: Option<&str>) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri("/sequence/v1/sequences")
            .header("content-type", "application/json")
            .header("x-openerp-permissions", "*");
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        req.body(Body::from(r#"{"name": "Receipts", "prefix": "RCPT/"}"#))
            .unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let resp = app(Arc::new(PermissionChecker))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sequence_module_is_nested() {
        let token = sign(SECRET, "ops", &["base:sequence:*"], 3600);
        let resp = app(Arc::new(PermissionChecker))
            .oneshot(create_request(Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let seq = json_body(resp).await;
        assert_eq!(seq["prefix"], "RCPT/");
        assert_eq!(seq["implementation"], "standard");
    }

    #[tokio::test]
    async fn module_routes_require_a_valid_token() {
        let app = app(Arc::new(PermissionChecker));

        let resp = app.clone().oneshot(create_request(None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(resp).await["code"], "UNAUTHENTICATED");

        let forged = sign("some-other-secret", "ops", &["*"], 3600);
        let resp = app.clone().oneshot(create_request(Some(&forged))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let expired = sign(SECRET, "ops", &["*"], -3600);
        let resp = app.oneshot(create_request(Some(&expired))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn permissions_come_from_the_token_not_headers() {
        let token = sign(SECRET, "clerk", &["base:sequence:read"], 3600);
        let resp = app(Arc::new(PermissionChecker))
            .oneshot(create_request(Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(resp).await["code"], "PERMISSION_DENIED");
    }
}
