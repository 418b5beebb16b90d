//! In-process marketplace backend used by the HTTP and refresh tests.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::{config::ClientSettings, credentials::CredentialStore, http::ApiClient};

pub const INITIAL_ACCESS: &str = "access-1";
pub const INITIAL_REFRESH: &str = "refresh-1";
pub const ROTATED_ACCESS: &str = "access-2";
pub const ROTATED_REFRESH: &str = "refresh-2";

#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendState>,
}

struct BackendState {
    valid_access: Mutex<String>,
    accept_refresh: AtomicBool,
    reject_after_refresh: AtomicBool,
    refresh_delay: Mutex<Duration>,
    refresh_calls: AtomicUsize,
    refresh_saw_authorization: AtomicBool,
    profile_calls: AtomicUsize,
    profile_authorizations: Mutex<Vec<Option<String>>>,
    request_ids: Mutex<Vec<String>>,
    logout_bodies: Mutex<Vec<Value>>,
}

impl Backend {
    fn new() -> Self {
        Self {
            inner: Arc::new(BackendState {
                valid_access: Mutex::new(INITIAL_ACCESS.to_string()),
                accept_refresh: AtomicBool::new(true),
                reject_after_refresh: AtomicBool::new(false),
                refresh_delay: Mutex::new(Duration::ZERO),
                refresh_calls: AtomicUsize::new(0),
                refresh_saw_authorization: AtomicBool::new(false),
                profile_calls: AtomicUsize::new(0),
                profile_authorizations: Mutex::new(Vec::new()),
                request_ids: Mutex::new(Vec::new()),
                logout_bodies: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Makes the backend treat the initial access token as expired.
    pub fn expire_access_token(&self) {
        *self.inner.valid_access.lock().expect("lock") = "none-yet".to_string();
    }

    pub fn reject_refresh(&self) {
        self.inner.accept_refresh.store(false, Ordering::SeqCst);
    }

    /// Refresh succeeds but the rotated token is still refused.
    pub fn reject_after_refresh(&self) {
        self.inner.reject_after_refresh.store(true, Ordering::SeqCst);
    }

    pub fn delay_refresh(&self, delay: Duration) {
        *self.inner.refresh_delay.lock().expect("lock") = delay;
    }

    pub fn refresh_calls(&self) -> usize {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_saw_authorization(&self) -> bool {
        self.inner.refresh_saw_authorization.load(Ordering::SeqCst)
    }

    pub fn profile_calls(&self) -> usize {
        self.inner.profile_calls.load(Ordering::SeqCst)
    }

    /// `Authorization` header of each `/profile` request, in arrival order.
    pub fn profile_authorizations(&self) -> Vec<Option<String>> {
        self.inner.profile_authorizations.lock().expect("lock").clone()
    }

    pub fn request_ids(&self) -> Vec<String> {
        self.inner.request_ids.lock().expect("lock").clone()
    }

    pub fn logout_bodies(&self) -> Vec<Value> {
        self.inner.logout_bodies.lock().expect("lock").clone()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        if let Some(id) = headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
            self.inner.request_ids.lock().expect("lock").push(id.to_string());
        }
        let expected = format!("Bearer {}", self.inner.valid_access.lock().expect("lock"));
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected)
    }
}

fn unauthorized() -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"success": false, "error": "Unauthorized", "message": "token expired"})),
    )
        .into_response()
}

async fn profile(State(backend): State<Backend>, headers: HeaderMap) -> axum::response::Response {
    backend.inner.profile_calls.fetch_add(1, Ordering::SeqCst);
    let authorization = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    backend
        .inner
        .profile_authorizations
        .lock()
        .expect("lock")
        .push(authorization);
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({"success": true, "data": {"id": "u-1", "name": "Ada"}})).into_response()
}

async fn refresh(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    backend.inner.refresh_calls.fetch_add(1, Ordering::SeqCst);
    if headers.contains_key("authorization") {
        backend
            .inner
            .refresh_saw_authorization
            .store(true, Ordering::SeqCst);
    }
    let delay = *backend.inner.refresh_delay.lock().expect("lock");
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let presented = body.get("refreshToken").and_then(Value::as_str);
    if !backend.inner.accept_refresh.load(Ordering::SeqCst) || presented != Some(INITIAL_REFRESH) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "message": "refresh token revoked"})),
        )
            .into_response();
    }

    if !backend.inner.reject_after_refresh.load(Ordering::SeqCst) {
        *backend.inner.valid_access.lock().expect("lock") = ROTATED_ACCESS.to_string();
    }
    Json(json!({
        "success": true,
        "data": {"accessToken": ROTATED_ACCESS, "refreshToken": ROTATED_REFRESH}
    }))
    .into_response()
}

async fn login(Json(body): Json<Value>) -> axum::response::Response {
    if body.get("password").and_then(Value::as_str) != Some("hunter2") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "message": "Invalid email or password"})),
        )
            .into_response();
    }
    Json(json!({
        "success": true,
        "data": {
            "user": {"id": "u-1", "email": body.get("email")},
            "tokens": {"accessToken": INITIAL_ACCESS, "refreshToken": INITIAL_REFRESH}
        }
    }))
    .into_response()
}

async fn signup(Json(body): Json<Value>) -> axum::response::Response {
    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "data": {
                "user": {"id": "u-2", "name": body.get("name")},
                "accessToken": INITIAL_ACCESS,
                "refreshToken": INITIAL_REFRESH
            }
        })),
    )
        .into_response()
}

async fn logout(State(backend): State<Backend>, Json(body): Json<Value>) -> StatusCode {
    backend.inner.logout_bodies.lock().expect("lock").push(body);
    StatusCode::NO_CONTENT
}

async fn conversations(
    State(backend): State<Backend>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({"success": true, "data": [{"id": "c-1"}, {"id": "c-2"}]})).into_response()
}

async fn messages(
    State(backend): State<Backend>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({"success": true, "data": [{"id": "m-1", "conversationId": id}]})).into_response()
}

async fn send_message(
    State(backend): State<Backend>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "data": {"id": "m-9", "conversationId": id, "content": body.get("content")}
        })),
    )
        .into_response()
}

async fn create_listing() -> axum::response::Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({"success": false, "error": "ValidationError", "message": "price must be positive"})),
    )
        .into_response()
}

async fn soft_failure() -> Json<Value> {
    Json(json!({"success": false, "message": "listing already sold"}))
}

async fn forbidden() -> axum::response::Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"success": false, "message": "not your listing"})),
    )
        .into_response()
}

async fn boom() -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Internal", "message": "database down"})),
    )
        .into_response()
}

async fn broken() -> &'static str {
    "<html>gateway says hi</html>"
}

async fn legacy() -> Json<Value> {
    Json(json!([{"id": "l-1"}, {"id": "l-2"}]))
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(3)).await;
    Json(json!({"success": true}))
}

pub async fn spawn_backend() -> anyhow::Result<(String, Backend)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let backend = Backend::new();
    let app = Router::new()
        .route("/api/profile", get(profile))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/login", post(login))
        .route("/api/auth/signup", post(signup))
        .route("/api/auth/logout", post(logout))
        .route("/api/conversations", get(conversations))
        .route(
            "/api/conversations/:id/messages",
            get(messages).post(send_message),
        )
        .route("/api/listings", post(create_listing))
        .route("/api/listings/sold", get(soft_failure))
        .route("/api/listings/mine", get(forbidden))
        .route("/api/boom", get(boom))
        .route("/api/broken", get(broken))
        .route("/api/legacy", get(legacy))
        .route("/api/slow", get(slow))
        .with_state(backend.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/api"), backend))
}

pub fn settings_for(api_base_url: &str) -> ClientSettings {
    ClientSettings {
        api_base_url: api_base_url.to_string(),
        request_timeout: Duration::from_millis(500),
        ..ClientSettings::default()
    }
}

/// Client plus memory credentials preloaded with the initial pair.
pub async fn signed_in_client(api_base_url: &str) -> (ApiClient, CredentialStore) {
    let credentials = CredentialStore::in_memory();
    credentials
        .save(&shared::domain::TokenPair::new(INITIAL_ACCESS, INITIAL_REFRESH))
        .await;
    let client = ApiClient::new(&settings_for(api_base_url), credentials.clone()).expect("client");
    (client, credentials)
}
