use std::sync::Arc;

use axum::{
    Json,
    extract::FromRequestParts,
    http::{HeaderValue, StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;

use super::helpers::{TokenValidationError, extract_token_from_header, validate_token};
use crate::loaders::Loaders;
use crate::server::AppState;
use crate::types::User;

/// The caller of a request, if any, with the loader set bound to them.
pub struct Viewer {
    pub user: Option<User>,
    pub loaders: Loaders,
}

/// Extractor that requires a token bound to a user.
pub struct RequireUser {
    pub user: User,
    pub loaders: Loaders,
}

#[derive(Debug)]
pub enum AuthError {
    MissingAuth,
    InvalidScheme,
    InvalidToken,
    TokenExpired,
    InternalError,
}

impl From<TokenValidationError> for AuthError {
    fn from(e: TokenValidationError) -> Self {
        match e {
            TokenValidationError::InvalidScheme => AuthError::InvalidScheme,
            TokenValidationError::InvalidToken => AuthError::InvalidToken,
            TokenValidationError::TokenExpired => AuthError::TokenExpired,
            TokenValidationError::InternalError => AuthError::InternalError,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidScheme => (StatusCode::UNAUTHORIZED, "Invalid authorization scheme"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "Token expired"),
            AuthError::InternalError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = json!({ "data": null, "error": message });

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                "WWW-Authenticate",
                HeaderValue::from_static("Bearer realm=\"bugnest\""),
            );
        }

        response
    }
}

impl FromRequestParts<Arc<AppState>> for Viewer {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user = authenticate(parts, state).await?;
        let loaders = state.loaders(user.as_ref().map(|u| u.id));
        Ok(Viewer { user, loaders })
    }
}

impl FromRequestParts<Arc<AppState>> for RequireUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user = authenticate(parts, state)
            .await?
            .ok_or(AuthError::MissingAuth)?;
        let loaders = state.loaders(Some(user.id));
        Ok(RequireUser { user, loaders })
    }
}

/// Resolves the Authorization header to a user. No header means anonymous;
/// a header that does not validate is rejected rather than downgraded.
async fn authenticate(parts: &Parts, state: &Arc<AppState>) -> Result<Option<User>, AuthError> {
    let auth_header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let Some(raw_token) = extract_token_from_header(auth_header)? else {
        return Ok(None);
    };

    let store = Arc::clone(&state.store);
    let user = tokio::task::spawn_blocking(move || validate_token(&store, &raw_token))
        .await
        .map_err(|_| AuthError::InternalError)??;
    Ok(Some(user))
}
