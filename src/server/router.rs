use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::post;
use axum::{Router, routing::get};
use rusqlite::Connection;

use super::api::api_router;
use super::internal::profile_update;
use super::response::{ApiError, ApiResult};
use crate::config::ServerConfig;
use crate::dump::DumpContext;
use crate::error::Result;
use crate::loaders::Loaders;
use crate::ops::Actor;
use crate::participants::ParticipantResolver;
use crate::signature::PayloadSigner;
use crate::store::SqliteStore;
use crate::types::User;
use crate::webhooks::DeliveryQueue;

pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub config: ServerConfig,
    pub resolver: ParticipantResolver,
    pub signer: Arc<dyn PayloadSigner>,
    /// Woken after every committed mutation.
    pub deliveries: DeliveryQueue,
    pub dump: DumpContext,
}

impl AppState {
    pub fn new(
        store: Arc<SqliteStore>,
        config: ServerConfig,
        resolver: ParticipantResolver,
        signer: Arc<dyn PayloadSigner>,
        deliveries: DeliveryQueue,
    ) -> Self {
        let dump = DumpContext::new(&config.origin, Arc::clone(&signer));
        Self {
            store,
            config,
            resolver,
            signer,
            deliveries,
            dump,
        }
    }

    /// A fresh loader set bound to `viewer`. Never share one across requests.
    pub fn loaders(&self, viewer: Option<i64>) -> Loaders {
        Loaders::new(
            Arc::clone(&self.store),
            &self.config,
            self.resolver.clone(),
            viewer,
        )
    }

    /// Runs a mutation in one transaction on the blocking pool, then wakes
    /// the delivery worker for whatever webhooks it scheduled.
    pub async fn mutate<T, F>(self: &Arc<Self>, user: &User, f: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &Actor<'_>) -> Result<T> + Send + 'static,
    {
        let value = self.transact(user, f).await?;
        self.deliveries.wake();
        Ok(value)
    }

    /// Like [`AppState::mutate`] for actor-scoped reads.
    pub async fn query<T, F>(self: &Arc<Self>, user: &User, f: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &Actor<'_>) -> Result<T> + Send + 'static,
    {
        self.transact(user, f).await
    }

    /// Runs a read on the shared connection from the blocking pool.
    pub async fn read<T, F>(self: &Arc<Self>, f: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let value = tokio::task::spawn_blocking(move || f(&store.connection()))
            .await
            .map_err(|e| {
                tracing::error!("blocking read panicked: {e}");
                ApiError::internal("Internal server error")
            })??;
        Ok(value)
    }

    async fn transact<T, F>(self: &Arc<Self>, user: &User, f: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &Actor<'_>) -> Result<T> + Send + 'static,
    {
        let state = Arc::clone(self);
        let user = user.clone();
        let value = tokio::task::spawn_blocking(move || {
            let actor = Actor::new(&user, &state.config.origin, &state.resolver);
            state.store.transaction(|tx| f(tx, &actor))
        })
        .await
        .map_err(|e| {
            tracing::error!("blocking transaction panicked: {e}");
            ApiError::internal("Internal server error")
        })??;
        Ok(value)
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        method = %method,
        path = uri.path(),
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "request"
    );

    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/profile-update", post(profile_update))
        .nest("/api/v1", api_router())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
