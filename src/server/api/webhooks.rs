use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::auth::RequireUser;
use crate::ops::webhooks as ops;
use crate::server::AppState;
use crate::server::dto::{CreateWebhookRequest, ListParams, WebhookListParams};
use crate::server::response::{ApiError, ApiResponse};
use crate::types::WebhookKind;

fn parse_kind(kind: &str) -> Result<WebhookKind, ApiError> {
    WebhookKind::parse(kind).ok_or_else(|| ApiError::not_found("Unknown webhook kind"))
}

pub async fn list_webhooks(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(params): Query<WebhookListParams>,
) -> impl IntoResponse {
    let kind = parse_kind(&kind)?;
    let cursor = params.cursor()?;
    let tracker_id = params.tracker_id;
    let page = state
        .query(&auth.user, move |conn, actor| {
            ops::list_webhooks(conn, actor, kind, tracker_id, &cursor)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

pub async fn create_webhook(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Json(req): Json<CreateWebhookRequest>,
) -> impl IntoResponse {
    let kind = parse_kind(&kind)?;
    let sub = state
        .mutate(&auth.user, move |conn, actor| {
            ops::create_webhook(conn, actor, kind, req.tracker_id, &req.webhook)
        })
        .await?;
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(sub))))
}

pub async fn get_webhook(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
) -> impl IntoResponse {
    let kind = parse_kind(&kind)?;
    let sub = state
        .query(&auth.user, move |conn, actor| ops::get_webhook(conn, actor, kind, id))
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(sub)))
}

pub async fn delete_webhook(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
) -> impl IntoResponse {
    let kind = parse_kind(&kind)?;
    state
        .mutate(&auth.user, move |conn, actor| {
            ops::delete_webhook(conn, actor, kind, id)
        })
        .await?;
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_deliveries(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let kind = parse_kind(&kind)?;
    let cursor = params.cursor()?;
    let page = state
        .query(&auth.user, move |conn, actor| {
            ops::list_deliveries(conn, actor, kind, id, &cursor)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}
