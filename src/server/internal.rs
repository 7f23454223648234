//! Callbacks from the identity service.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
};

use crate::ops::users::{ProfileUpdate, apply_profile_update};
use crate::server::AppState;
use crate::server::response::{ApiError, ApiResponse};
use crate::signature::{NONCE_HEADER, SIGNATURE_HEADER};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `profile:update` receiver. The body must carry a signature made with the
/// shared internal key.
pub async fn profile_update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let (Some(nonce), Some(signature)) = (
        header(&headers, NONCE_HEADER),
        header(&headers, SIGNATURE_HEADER),
    ) else {
        return Err(ApiError::unauthorized("Missing payload signature"));
    };
    if !state.signer.verify(&body, nonce, signature) {
        tracing::warn!("rejected profile update with a bad signature");
        return Err(ApiError::unauthorized("Invalid payload signature"));
    }

    let update: ProfileUpdate = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("Invalid profile payload: {e}")))?;
    let user = state
        .read(move |conn| apply_profile_update(conn, &update))
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(user)))
}
