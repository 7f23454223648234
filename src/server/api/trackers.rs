use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::auth::{RequireUser, Viewer};
use crate::loaders::Loaders;
use crate::ops;
use crate::ops::labels::LabelInput;
use crate::ops::trackers::{TrackerInput, TrackerUpdate};
use crate::server::AppState;
use crate::server::dto::{AclRequest, ListParams};
use crate::server::response::{ApiError, ApiResponse};
use crate::store::trackers as store;
use crate::types::{Access, Tracker, paginate};

pub async fn me(auth: RequireUser) -> impl IntoResponse {
    Json(ApiResponse::success(auth.user))
}

pub async fn list_trackers(
    viewer: Viewer,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let cursor = params.cursor()?;
    let viewer_id = viewer.user.map(|u| u.id);
    let page = state
        .read(move |conn| {
            let rows = store::list_trackers(conn, viewer_id, None, &cursor)?;
            Ok(paginate(rows, &cursor, |t| t.id))
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

pub async fn create_tracker(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Json(input): Json<TrackerInput>,
) -> impl IntoResponse {
    let tracker = state
        .mutate(&auth.user, move |conn, actor| {
            ops::trackers::create_tracker(conn, actor, &input)
        })
        .await?;
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(tracker))))
}

pub(super) async fn load_tracker(loaders: &Loaders, id: i64) -> Result<Tracker, ApiError> {
    loaders
        .trackers_by_id
        .load(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Tracker not found"))
}

pub async fn get_tracker(viewer: Viewer, Path(id): Path<i64>) -> impl IntoResponse {
    let tracker = load_tracker(&viewer.loaders, id).await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(tracker)))
}

pub async fn get_tracker_by_name(
    viewer: Viewer,
    Path((username, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let username = username.trim_start_matches('~').to_string();
    let tracker = viewer
        .loaders
        .trackers_by_owner_name
        .load((username, name))
        .await?
        .ok_or_else(|| ApiError::not_found("Tracker not found"))?;
    Ok::<_, ApiError>(Json(ApiResponse::success(tracker)))
}

pub async fn update_tracker(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(update): Json<TrackerUpdate>,
) -> impl IntoResponse {
    let tracker = state
        .mutate(&auth.user, move |conn, actor| {
            ops::trackers::update_tracker(conn, actor, id, &update)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(tracker)))
}

pub async fn delete_tracker(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    state
        .mutate(&auth.user, move |conn, actor| {
            ops::trackers::delete_tracker(conn, actor, id)
        })
        .await?;
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_acls(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let cursor = params.cursor()?;
    let tracker = load_tracker(&auth.loaders, id).await?;
    if tracker.owner_id != auth.user.id {
        return Err(ApiError::forbidden("Only the tracker owner can list access grants"));
    }
    let page = state
        .read(move |conn| {
            let rows = store::list_acls(conn, tracker.id, &cursor)?;
            Ok(paginate(rows, &cursor, |acl| acl.id))
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

pub async fn set_acl(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<AclRequest>,
) -> impl IntoResponse {
    let permissions = Access::parse_many(&req.permissions)
        .ok_or_else(|| ApiError::bad_request("Unknown access name"))?;
    let acl = state
        .mutate(&auth.user, move |conn, actor| {
            ops::trackers::set_acl(conn, actor, id, &req.username, permissions)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(acl)))
}

pub async fn delete_acl(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, user_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    state
        .mutate(&auth.user, move |conn, actor| {
            ops::trackers::delete_acl(conn, actor, id, user_id)
        })
        .await?;
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_labels(
    viewer: Viewer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let cursor = params.cursor()?;
    let tracker = load_tracker(&viewer.loaders, id).await?;
    let page = state
        .read(move |conn| {
            let rows = store::list_labels(conn, tracker.id, &cursor)?;
            Ok(paginate(rows, &cursor, |l| l.id))
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

pub async fn create_label(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(input): Json<LabelInput>,
) -> impl IntoResponse {
    let label = state
        .mutate(&auth.user, move |conn, actor| {
            ops::labels::create_label(conn, actor, id, &input)
        })
        .await?;
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(label))))
}

pub async fn update_label(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, label_id)): Path<(i64, i64)>,
    Json(input): Json<LabelInput>,
) -> impl IntoResponse {
    let label = state
        .mutate(&auth.user, move |conn, actor| {
            ops::labels::update_label(conn, actor, id, label_id, &input)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(label)))
}

pub async fn delete_label(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, label_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    state
        .mutate(&auth.user, move |conn, actor| {
            ops::labels::delete_label(conn, actor, id, label_id)
        })
        .await?;
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}
