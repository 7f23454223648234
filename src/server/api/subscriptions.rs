use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::auth::RequireUser;
use crate::ops::subscriptions as ops;
use crate::server::AppState;
use crate::server::dto::ListParams;
use crate::server::response::{ApiError, ApiResponse};
use crate::types::SubscriptionTarget;

pub async fn subscribe_tracker(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let sub = state
        .mutate(&auth.user, move |conn, actor| ops::subscribe_tracker(conn, actor, id))
        .await?;
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(sub))))
}

pub async fn unsubscribe_tracker(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    state
        .mutate(&auth.user, move |conn, actor| {
            ops::unsubscribe(conn, actor, SubscriptionTarget::Tracker(id))
        })
        .await?;
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn subscribe_ticket(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    let sub = state
        .mutate(&auth.user, move |conn, actor| {
            ops::subscribe_ticket(conn, actor, id, ticket_id)
        })
        .await?;
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(sub))))
}

pub async fn unsubscribe_ticket(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    state
        .mutate(&auth.user, move |conn, actor| {
            ops::unsubscribe_ticket(conn, actor, id, ticket_id)
        })
        .await?;
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_subscriptions(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let cursor = params.cursor()?;
    let page = state
        .query(&auth.user, move |conn, actor| {
            ops::list_subscriptions(conn, actor, &cursor)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

pub async fn inbox(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let cursor = params.cursor()?;
    let page = state
        .query(&auth.user, move |conn, actor| ops::inbox(conn, actor, &cursor))
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}
