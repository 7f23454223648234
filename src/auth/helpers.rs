use chrono::Utc;

use super::{TokenGenerator, parse_token};
use crate::store::{SqliteStore, users};
use crate::types::User;

#[derive(Debug)]
pub enum TokenValidationError {
    InvalidScheme,
    InvalidToken,
    TokenExpired,
    InternalError,
}

/// Extracts a token string from a Basic auth header.
/// Expects format: Basic base64(x-token:actual_token)
pub fn extract_basic_auth_token(header: &str) -> Option<String> {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    let encoded = header.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;

    let (username, password) = credentials.split_once(':')?;

    if username != "x-token" {
        return None;
    }

    Some(password.to_string())
}

/// Validates a raw token and returns the user it is bound to.
pub fn validate_token(store: &SqliteStore, raw_token: &str) -> Result<User, TokenValidationError> {
    let (lookup, _secret) = parse_token(raw_token).map_err(|_| TokenValidationError::InvalidToken)?;

    let conn = store.connection();
    let token = users::get_token_by_lookup(&conn, &lookup)
        .map_err(|_| TokenValidationError::InternalError)?
        .ok_or(TokenValidationError::InvalidToken)?;

    let generator = TokenGenerator::new().map_err(|_| TokenValidationError::InternalError)?;
    if !generator
        .verify(raw_token, &token.token_hash)
        .map_err(|_| TokenValidationError::InternalError)?
    {
        return Err(TokenValidationError::InvalidToken);
    }

    if token.expires_at.is_some_and(|expires_at| expires_at < Utc::now()) {
        return Err(TokenValidationError::TokenExpired);
    }

    let user = users::get_user(&conn, token.user_id)
        .map_err(|_| TokenValidationError::InternalError)?
        .ok_or(TokenValidationError::InvalidToken)?;

    if let Err(e) = users::update_token_last_used(&conn, &token.id) {
        tracing::warn!("Failed to update token last_used_at: {e}");
    }

    Ok(user)
}

/// Extracts token from Authorization header (Bearer or Basic).
/// Returns None if no auth header is present.
/// Returns Err if the auth scheme is unsupported.
pub fn extract_token_from_header(
    auth_header: Option<&str>,
) -> Result<Option<String>, TokenValidationError> {
    let Some(header) = auth_header else {
        return Ok(None);
    };
    if let Some(token) = header.strip_prefix("Bearer ") {
        return Ok(Some(token.to_string()));
    }
    if header.starts_with("Basic ") {
        return extract_basic_auth_token(header)
            .ok_or(TokenValidationError::InvalidToken)
            .map(Some);
    }
    Err(TokenValidationError::InvalidScheme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    #[test]
    fn test_extract_token_from_header() {
        assert!(extract_token_from_header(None).unwrap().is_none());
        assert_eq!(
            extract_token_from_header(Some("Bearer abc")).unwrap().as_deref(),
            Some("abc")
        );
        let basic = format!("Basic {}", STANDARD.encode("x-token:abc"));
        assert_eq!(
            extract_token_from_header(Some(&basic)).unwrap().as_deref(),
            Some("abc")
        );
        let wrong_user = format!("Basic {}", STANDARD.encode("admin:abc"));
        assert!(matches!(
            extract_token_from_header(Some(&wrong_user)),
            Err(TokenValidationError::InvalidToken)
        ));
        assert!(matches!(
            extract_token_from_header(Some("Digest abc")),
            Err(TokenValidationError::InvalidScheme)
        ));
    }
}
