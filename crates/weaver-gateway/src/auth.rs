use weaver_core::config::{ApiKeyRole, GatewayConfig};

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub name: String,
    pub role: ApiKeyRole,
}

/// Full validation: Bearer header -> api_keys -> shared token -> anonymous.
///
/// Returns `Some(AuthResult)` on success, `None` on auth failure.
pub fn validate_auth(
    config: &GatewayConfig,
    bearer: Option<&str>,
    query_token: Option<&str>,
) -> Option<AuthResult> {
    // Browsers cannot set headers on an EventSource, so the token may also come from the query
    let presented = bearer.or(query_token);

    if let Some(value) = presented {
        if let Some(key) = config.api_keys.iter().find(|k| k.key == value) {
            return Some(AuthResult {
                name: key.name.clone(),
                role: key.role.clone(),
            });
        }
        if config.token.as_deref() == Some(value) {
            return Some(AuthResult {
                name: "token".into(),
                role: ApiKeyRole::Admin,
            });
        }
        return None;
    }

    // No credentials configured = anonymous access
    if config.token.is_none() && config.api_keys.is_empty() {
        Some(AuthResult {
            name: "anonymous".into(),
            role: ApiKeyRole::Admin,
        })
    } else {
        None
    }
}

/// Extract token from the query string (?token=...).
pub fn extract_token_from_query(query: &str) -> Option<&str> {
    query.split('&').find_map(|pair| pair.strip_prefix("token="))
}

/// Check if a role has at least viewer-level access.
pub fn has_viewer_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Viewer | ApiKeyRole::Operator | ApiKeyRole::Admin)
}

/// Check if a role has at least operator-level access.
pub fn has_operator_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Operator | ApiKeyRole::Admin)
}
