use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::trackers::load_tracker;
use crate::auth::{RequireUser, Viewer};
use crate::loaders::Loaders;
use crate::ops;
use crate::ops::tickets::{CommentInput, TicketInput, TicketUpdate};
use crate::server::AppState;
use crate::server::dto::{
    AssigneeRequest, CommentEditRequest, EventResponse, ListParams, StatusRequest,
    TicketLabelRequest, TicketView,
};
use crate::server::response::{ApiError, ApiResponse};
use crate::store::{events, tickets as store};
use crate::types::{Ticket, paginate};

async fn load_ticket(loaders: &Loaders, tracker_id: i64, scoped_id: i64) -> Result<Ticket, ApiError> {
    loaders
        .tickets_by_scoped_id
        .load((tracker_id, scoped_id))
        .await?
        .ok_or_else(|| ApiError::not_found("Ticket not found"))
}

pub async fn list_tickets(
    viewer: Viewer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let cursor = params.cursor()?;
    let tracker = load_tracker(&viewer.loaders, id).await?;
    let viewer_id = viewer.loaders.viewer;
    let page = state
        .read(move |conn| {
            let rows = store::list_tickets(conn, viewer_id, tracker.id, None, &cursor)?;
            Ok(paginate(rows, &cursor, |t| t.id))
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

pub async fn get_ticket(
    viewer: Viewer,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    let ticket = load_ticket(&viewer.loaders, id, ticket_id).await?;
    let submitter = viewer
        .loaders
        .participants_by_id
        .load(ticket.submitter_id)
        .await?;
    let ticket_pk = ticket.id;
    let (labels, assignees) = state
        .read(move |conn| {
            Ok((
                store::ticket_labels(conn, ticket_pk)?,
                store::ticket_assignees(conn, ticket_pk)?,
            ))
        })
        .await?;
    let view = TicketView {
        reference: ticket.reference().to_string(),
        ticket,
        submitter,
        labels,
        assignees,
    };
    Ok::<_, ApiError>(Json(ApiResponse::success(view)))
}

pub async fn submit_ticket(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(input): Json<TicketInput>,
) -> impl IntoResponse {
    let ticket = state
        .mutate(&auth.user, move |conn, actor| {
            ops::tickets::submit_ticket(conn, actor, id, &input)
        })
        .await?;
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(ticket))))
}

pub async fn update_ticket(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id)): Path<(i64, i64)>,
    Json(update): Json<TicketUpdate>,
) -> impl IntoResponse {
    let ticket = state
        .mutate(&auth.user, move |conn, actor| {
            ops::tickets::update_ticket(conn, actor, id, ticket_id, &update)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(ticket)))
}

pub async fn delete_ticket(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    state
        .mutate(&auth.user, move |conn, actor| {
            ops::tickets::delete_ticket(conn, actor, id, ticket_id)
        })
        .await?;
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_events(
    viewer: Viewer,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id)): Path<(i64, i64)>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let cursor = params.cursor()?;
    let ticket = load_ticket(&viewer.loaders, id, ticket_id).await?;
    let page = state
        .read(move |conn| {
            let rows = events::list_events(conn, ticket.id, &cursor)?;
            Ok(paginate(rows, &cursor, |e| e.id))
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

pub async fn comment(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id)): Path<(i64, i64)>,
    Json(input): Json<CommentInput>,
) -> impl IntoResponse {
    let event = state
        .mutate(&auth.user, move |conn, actor| {
            ops::tickets::comment(conn, actor, id, ticket_id, &input)
        })
        .await?;
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(event))))
}

pub async fn edit_comment(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id, comment_id)): Path<(i64, i64, i64)>,
    Json(req): Json<CommentEditRequest>,
) -> impl IntoResponse {
    let comment = state
        .mutate(&auth.user, move |conn, actor| {
            ops::tickets::edit_comment(conn, actor, id, ticket_id, comment_id, &req.text)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(comment)))
}

pub async fn update_status(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id)): Path<(i64, i64)>,
    Json(req): Json<StatusRequest>,
) -> impl IntoResponse {
    let event = state
        .mutate(&auth.user, move |conn, actor| {
            ops::tickets::update_status(conn, actor, id, ticket_id, req.status, req.resolution)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(EventResponse { event })))
}

pub async fn add_label(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id)): Path<(i64, i64)>,
    Json(req): Json<TicketLabelRequest>,
) -> impl IntoResponse {
    let event = state
        .mutate(&auth.user, move |conn, actor| {
            ops::tickets::add_label(conn, actor, id, ticket_id, req.label_id)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(event)))
}

pub async fn remove_label(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id, label_id)): Path<(i64, i64, i64)>,
) -> impl IntoResponse {
    let event = state
        .mutate(&auth.user, move |conn, actor| {
            ops::tickets::remove_label(conn, actor, id, ticket_id, label_id)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(event)))
}

pub async fn assign(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id)): Path<(i64, i64)>,
    Json(req): Json<AssigneeRequest>,
) -> impl IntoResponse {
    let event = state
        .mutate(&auth.user, move |conn, actor| {
            ops::tickets::assign(conn, actor, id, ticket_id, &req.username)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(event)))
}

pub async fn unassign(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path((id, ticket_id, username)): Path<(i64, i64, String)>,
) -> impl IntoResponse {
    let event = state
        .mutate(&auth.user, move |conn, actor| {
            ops::tickets::unassign(conn, actor, id, ticket_id, &username)
        })
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(event)))
}
