//! Caller identity and the pluggable permission check.
//!
//! Modules never depend on a concrete auth implementation. They receive an
//! `Arc<dyn Authenticator>` at startup and ask it whether a [`Caller`] holds
//! a permission string such as `base:sequence:read`.

use serde::{Deserialize, Serialize};

use crate::ServiceError;

/// The party on whose behalf an operation runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    /// User id, used in log lines and error messages.
    pub user: String,

    /// The company the caller is currently working in.
    #[serde(default)]
    pub company_id: Option<i64>,

    /// Granted permission patterns, e.g. `base:sequence:read` or `base:*`.
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Caller {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn with_company(mut self, company_id: i64) -> Self {
        self.company_id = Some(company_id);
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    /// Whether any granted pattern covers `permission`.
    ///
    /// A pattern matches segment by segment (`:` separated); a trailing `*`
    /// segment matches any remainder.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions
            .iter()
            .any(|pattern| permission_matches(pattern, permission))
    }
}

fn permission_matches(pattern: &str, permission: &str) -> bool {
    let mut want = permission.split(':');
    for seg in pattern.split(':') {
        if seg == "*" {
            return true;
        }
        match want.next() {
            Some(w) if w == seg => {}
            _ => return false,
        }
    }
    want.next().is_none()
}

/// Pluggable permission check, called by every module operation that
/// reads or mutates protected configuration.
pub trait Authenticator: Send + Sync + 'static {
    /// Returns `Ok(())` if allowed, `Err(ServiceError::PermissionDenied)` otherwise.
    fn check(&self, caller: &Caller, permission: &str) -> Result<(), ServiceError>;
}

/// A no-op authenticator that allows everything. Used for testing
/// and for single-tenant deployments.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn check(&self, _caller: &Caller, _permission: &str) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// An authenticator that denies everything. Used for testing.
pub struct DenyAll;

impl Authenticator for DenyAll {
    fn check(&self, _caller: &Caller, permission: &str) -> Result<(), ServiceError> {
        Err(ServiceError::PermissionDenied(format!("access denied: {permission}")))
    }
}

/// Grants exactly the permissions listed on the caller.
pub struct PermissionChecker;

impl Authenticator for PermissionChecker {
    fn check(&self, caller: &Caller, permission: &str) -> Result<(), ServiceError> {
        if caller.has_permission(permission) {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(format!(
                "user '{}' lacks permission {}",
                caller.user, permission
            )))
        }
    }
}
