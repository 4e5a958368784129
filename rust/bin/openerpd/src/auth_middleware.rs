//! JWT authentication middleware.
//!
//! Extracts the JWT from `Authorization: Bearer <token>`, validates it and
//! hands the caller it describes to the module handlers. Identity and
//! permissions come from the signed claims only.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{DecodingKey, Validation};
use openerp_core::{Caller, ServiceError};
use serde::{Deserialize, Serialize};

/// JWT claims payload issued by the login service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: user id.
    pub sub: String,
    /// Company the session works in.
    #[serde(default)]
    pub company_id: Option<i64>,
    /// Granted permission patterns, e.g. `base:sequence:read`.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Issued at (unix timestamp).
    #[serde(default)]
    pub iat: i64,
    /// Expiration (unix timestamp).
    pub exp: i64,
}

impl Claims {
    pub fn caller(&self) -> Caller {
        let caller = Caller::new(self.sub.clone()).with_permissions(self.permissions.iter().cloned());
        match self.company_id {
            Some(id) => caller.with_company(id),
            None => caller,
        }
    }
}

/// Shared JWT configuration for the middleware.
#[derive(Clone)]
pub struct JwtState {
    pub decoding_key: DecodingKey,
    pub validation: Validation,
}

impl JwtState {
    /// HMAC-SHA256 verification with the shared secret.
    pub fn from_secret(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

/// Middleware that validates the bearer token of every non-public request
/// and stores its claims and the derived [`Caller`] in the request extensions.
pub async fn auth_middleware(
    State(jwt_state): State<Arc<JwtState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    if is_public_path(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ServiceError::Unauthorized("missing authorization token".into()))?;

    let token_data =
        jsonwebtoken::decode::<Claims>(token, &jwt_state.decoding_key, &jwt_state.validation)
            .map_err(|e| ServiceError::Unauthorized(format!("invalid token: {e}")))?;

    let caller = token_data.claims.caller();
    request.extensions_mut().insert(caller);
    request.extensions_mut().insert(token_data.claims);

    Ok(next.run(request).await)
}

/// Check if a request path is public (no auth required).
fn is_public_path(path: &str) -> bool {
    matches!(path, "/health" | "/version")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_map_to_caller() {
        let claims = Claims {
            sub: "u7".into(),
            company_id: Some(3),
            permissions: vec!["base:sequence:read".into()],
            iat: 0,
            exp: 0,
        };
        let caller = claims.caller();
        assert_eq!(caller.user, "u7");
        assert_eq!(caller.company_id, Some(3));
        assert!(caller.has_permission("base:sequence:read"));
        assert!(!caller.has_permission("base:sequence:write"));
    }

    #[test]
    fn only_system_endpoints_are_public() {
        assert!(is_public_path("/health"));
        assert!(is_public_path("/version"));
        assert!(!is_public_path("/sequence/v1/sequences"));
    }
}
