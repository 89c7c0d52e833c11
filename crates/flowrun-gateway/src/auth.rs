use std::borrow::Cow;

use flowrun_core::config::{ApiKeyRole, GatewayConfig};

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub name: String,
    pub role: ApiKeyRole,
}

impl AuthResult {
    fn admin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            role: ApiKeyRole::Admin,
        }
    }
}

/// Full validation: Bearer header -> api_keys -> legacy token -> query token -> anonymous.
///
/// Returns `Some(AuthResult)` on success, `None` on auth failure.
pub fn validate_auth(
    config: &GatewayConfig,
    bearer: Option<&str>,
    query_token: Option<&str>,
) -> Option<AuthResult> {
    // Browsers cannot set headers on a WebSocket upgrade, so the query
    // token is checked the same way as a bearer credential.
    if let Some(credential) = bearer.or(query_token) {
        if let Some(ak) = config.api_keys.iter().find(|ak| ak.key == credential) {
            return Some(AuthResult {
                name: ak.name.clone(),
                role: ak.role,
            });
        }
        if config.token.as_deref() == Some(credential) {
            return Some(AuthResult::admin("legacy-token"));
        }
        if bearer.is_some() {
            return None; // Bearer provided but no match
        }
    }

    // No auth configured = anonymous access
    if config.token.is_none() && config.api_keys.is_empty() {
        Some(AuthResult::admin("anonymous"))
    } else {
        None
    }
}

/// Extract token from the query string (?token=...).
pub fn extract_token_from_query(query: &str) -> Option<Cow<'_, str>> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(|val| urlencoding::decode(val).unwrap_or(Cow::Borrowed(val)))
}

/// Check if a role has at least viewer-level access.
pub fn has_viewer_access(role: &ApiKeyRole) -> bool {
    *role >= ApiKeyRole::Viewer
}

/// Check if a role has at least operator-level access.
pub fn has_operator_access(role: &ApiKeyRole) -> bool {
    *role >= ApiKeyRole::Operator
}
