use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};

use super::trackers::load_tracker;
use crate::auth::{RequireUser, Viewer};
use crate::dump::{self, read_dump, run_import_job};
use crate::ops;
use crate::server::AppState;
use crate::server::dto::ImportAccepted;
use crate::server::response::{ApiError, ApiResponse};

/// Streams the gzipped dump of a tracker as the viewer sees it.
pub async fn export_tracker(
    viewer: Viewer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let tracker = load_tracker(&viewer.loaders, id).await?;
    let viewer_id = viewer.loaders.viewer;
    let filename = format!("{}-{}.json.gz", tracker.owner_name, tracker.name);
    let ctx = state.dump.clone();
    let bytes = state
        .read(move |conn| {
            let mut out = Vec::new();
            dump::export_tracker(conn, &ctx, &tracker, viewer_id, &mut out)?;
            Ok(out)
        })
        .await?;
    Ok::<_, ApiError>((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    ))
}

/// Accepts a gzipped dump for an empty tracker the caller owns. The import
/// itself runs in the background.
pub async fn import_tracker(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Bytes,
) -> impl IntoResponse {
    let dump = tokio::task::spawn_blocking(move || read_dump(body.as_ref()))
        .await
        .map_err(|_| ApiError::internal("Internal server error"))?
        .map_err(|e| ApiError::bad_request(format!("Invalid tracker dump: {e}")))?;

    let tracker = state
        .mutate(&auth.user, move |conn, actor| {
            ops::trackers::begin_import(conn, actor, id)
        })
        .await?;

    let accepted = ImportAccepted {
        tracker_id: tracker.id,
        tickets: dump.tickets.len(),
    };
    let job_state = Arc::clone(&state);
    tokio::spawn(async move {
        let result = run_import_job(
            Arc::clone(&job_state.store),
            job_state.dump.clone(),
            job_state.resolver.clone(),
            tracker.id,
            dump,
            job_state.config.import_timeout(),
        )
        .await;
        if let Err(e) = result {
            tracing::warn!(tracker = tracker.id, "background import failed: {e}");
        }
    });

    Ok::<_, ApiError>((StatusCode::ACCEPTED, Json(ApiResponse::success(accepted))))
}
