#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use bugnest::auth::issue_token;
use bugnest::config::ServerConfig;
use bugnest::participants::{NoFederation, ParticipantResolver};
use bugnest::server::{AppState, create_router};
use bugnest::signature::{HmacSigner, PayloadSigner};
use bugnest::store::SqliteStore;
use bugnest::store::users::{self, NewUser};
use bugnest::types::User;
use bugnest::webhooks::DeliveryQueue;
use serde_json::Value;
use tower::ServiceExt;

pub const ORIGIN: &str = "https://todo.example.org";
pub const INTERNAL_KEY: &str = "integration-test-key-0123456789";

/// An in-process server over an in-memory database.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub router: Router,
}

pub struct Response {
    pub status: StatusCode,
    pub body: Value,
    pub bytes: Vec<u8>,
}

pub fn config() -> ServerConfig {
    ServerConfig {
        origin: ORIGIN.to_string(),
        meta_origin: "https://meta.example.org".to_string(),
        internal_key: INTERNAL_KEY.to_string(),
        ..ServerConfig::default()
    }
}

pub fn signer() -> Arc<dyn PayloadSigner> {
    Arc::new(HmacSigner::new(INTERNAL_KEY.as_bytes()))
}

impl TestApp {
    pub fn new() -> Self {
        let store = SqliteStore::open_in_memory().expect("open store");
        store.initialize().expect("initialize schema");
        let state = Arc::new(AppState::new(
            Arc::new(store),
            config(),
            ParticipantResolver::new(Arc::new(NoFederation)),
            signer(),
            DeliveryQueue::new(),
        ));
        let router = create_router(Arc::clone(&state));
        Self { state, router }
    }

    /// Creates a user and returns it with a fresh API token.
    pub fn user(&self, username: &str) -> (User, String) {
        self.state
            .store
            .transaction(|tx| {
                let user = users::create_user(
                    tx,
                    &NewUser {
                        username: username.to_string(),
                        email: format!("{username}@example.org"),
                        ..NewUser::default()
                    },
                )?;
                let token = issue_token(tx, user.id)?;
                Ok((user, token))
            })
            .expect("create user")
    }

    pub fn count(&self, sql: &str) -> i64 {
        self.state
            .store
            .connection()
            .query_row(sql, [], |row| row.get(0))
            .expect("count query")
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body")
            .to_vec();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Response {
            status,
            body,
            bytes,
        }
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Response {
        let mut builder = Request::builder().method("GET").uri(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty()).expect("request"))
            .await
    }

    pub async fn json(&self, method: &str, path: &str, token: &str, body: Value) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        self.send(request).await
    }

    pub async fn delete(&self, path: &str, token: &str) -> Response {
        let request = Request::builder()
            .method("DELETE")
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");
        self.send(request).await
    }

    /// Creates a tracker over HTTP and returns its id.
    pub async fn tracker(&self, token: &str, name: &str, visibility: &str) -> i64 {
        let resp = self
            .json(
                "POST",
                "/api/v1/trackers",
                token,
                serde_json::json!({ "name": name, "visibility": visibility }),
            )
            .await;
        assert_eq!(resp.status, StatusCode::CREATED, "{}", resp.body);
        resp.body["data"]["id"].as_i64().expect("tracker id")
    }
}
