//! Axum JSON API for Cuponera: discounts, click tracking, accounts, crawl trigger.

use std::collections::BTreeSet;
use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use axum::{
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use cuponera_core::{Counter, DiscountPatch, DiscountRef, User};
use cuponera_crawl::{CrawlError, CrawlOrchestrator};
use cuponera_store::{RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cuponera-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub crawler: Arc<CrawlOrchestrator>,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>, crawler: Arc<CrawlOrchestrator>) -> Self {
        Self { store, crawler }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    name: String,
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct VerifyBody {
    verified: bool,
}

#[derive(Debug, Deserialize)]
struct FeedbackBody {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    id: Uuid,
    name: String,
    email: String,
    favorites: BTreeSet<Uuid>,
    token: String,
}

impl AuthResponse {
    fn for_user(user: User, token: String) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            favorites: user.favorites,
            token,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/discounts", get(list_discounts_handler))
        .route("/api/discounts/{id}/verify", patch(verify_discount_handler))
        .route("/api/discounts/{id}/feedback", post(feedback_handler))
        .route("/api/track/{id}", get(track_click_handler))
        .route("/api/crawl", post(trigger_crawl_handler))
        .route("/api/auth/register", post(register_handler))
        .route("/api/auth/login", post(login_handler))
        .route("/api/auth/favorites", get(favorites_handler))
        .route("/api/auth/favorites/{id}", post(toggle_favorite_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("CUPONERA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "cuponera api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn root_handler() -> Response {
    Json(serde_json::json!({"message": "Cuponera API is running"})).into_response()
}

async fn list_discounts_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_active().await {
        Ok(discounts) => Json(discounts).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn verify_discount_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<VerifyBody>,
) -> Response {
    let reference = DiscountRef::parse(id);
    let patch = DiscountPatch::SetVerified {
        verified: body.verified,
        at: Utc::now(),
    };
    match state.store.update_discount(&reference, patch).await {
        Ok(discount) => Json(serde_json::json!({
            "message": "Discount verification updated",
            "discount": discount,
        }))
        .into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn track_click_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let reference = DiscountRef::parse(id);
    match state
        .store
        .update_discount(&reference, DiscountPatch::Increment(Counter::Clicks))
        .await
    {
        Ok(discount) => Redirect::temporary(discount.outbound_url()).into_response(),
        Err(StoreError::NotFound) => {
            message_response(StatusCode::NOT_FOUND, "Discount URL not found")
        }
        Err(err) => store_error_response(err),
    }
}

async fn feedback_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<FeedbackBody>,
) -> Response {
    let counter = match body.kind.as_str() {
        "like" => Counter::Likes,
        "dislike" => Counter::Dislikes,
        _ => return message_response(StatusCode::BAD_REQUEST, "Invalid feedback type"),
    };
    let reference = DiscountRef::parse(id);
    match state
        .store
        .update_discount(&reference, DiscountPatch::Increment(counter))
        .await
    {
        Ok(discount) => Json(serde_json::json!({
            "likes": discount.likes,
            "dislikes": discount.dislikes,
        }))
        .into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn trigger_crawl_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.crawler.run_once().await {
        Ok(report) => Json(report).into_response(),
        Err(CrawlError::Busy) => {
            message_response(StatusCode::CONFLICT, "A crawl is already running")
        }
        Err(err) => {
            error!(error = %err, "manual crawl failed");
            message_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Crawl failed: {err}"),
            )
        }
    }
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> Response {
    let name = body.name.trim().to_string();
    let email = body.email.trim().to_lowercase();
    if name.is_empty() || email.is_empty() || body.password.is_empty() {
        return message_response(
            StatusCode::BAD_REQUEST,
            "Name, email and password are required",
        );
    }
    match state.store.find_user_by_email(&email).await {
        Ok(Some(_)) => return message_response(StatusCode::BAD_REQUEST, "User already exists"),
        Ok(None) => {}
        Err(err) => return store_error_response(err),
    }
    let password_hash = match hash_password(&body.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!(error = %err, "password hashing failed");
            return message_response(StatusCode::INTERNAL_SERVER_ERROR, "Server error");
        }
    };
    let user = User {
        id: Uuid::new_v4(),
        name,
        email,
        password_hash,
        favorites: BTreeSet::new(),
        session_token_hash: None,
        created_at: Utc::now(),
    };
    let user = match state.store.insert_user(user).await {
        Ok(user) => user,
        Err(err) => return store_error_response(err),
    };
    match issue_session(&state.store, user.id).await {
        Ok(token) => (
            StatusCode::CREATED,
            Json(AuthResponse::for_user(user, token)),
        )
            .into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn login_handler(State(state): State<Arc<AppState>>, Json(body): Json<LoginBody>) -> Response {
    let email = body.email.trim().to_lowercase();
    let user = match state.store.find_user_by_email(&email).await {
        Ok(Some(user)) => user,
        Ok(None) => return message_response(StatusCode::UNAUTHORIZED, "Invalid email or password"),
        Err(err) => return store_error_response(err),
    };
    if !verify_password(&body.password, &user.password_hash) {
        return message_response(StatusCode::UNAUTHORIZED, "Invalid email or password");
    }
    match issue_session(&state.store, user.id).await {
        Ok(token) => Json(AuthResponse::for_user(user, token)).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn toggle_favorite_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let user = match authenticated_user(&state.store, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    let reference = DiscountRef::parse(id);
    let discount = match state.store.find_discount(&reference).await {
        Ok(Some(discount)) => discount,
        Ok(None) => return message_response(StatusCode::NOT_FOUND, "Discount not found"),
        Err(err) => return store_error_response(err),
    };
    match state.store.toggle_favorite(user.id, discount.id).await {
        Ok(favorites) => Json(serde_json::json!({"favorites": favorites})).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn favorites_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user = match authenticated_user(&state.store, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.favorites(user.id).await {
        Ok(favorites) => Json(serde_json::json!({"favorites": favorites})).into_response(),
        Err(err) => store_error_response(err),
    }
}

/// Resolve the `Authorization: Bearer <token>` header to a user. Tokens are
/// stored hashed, so the lookup hashes before comparing.
async fn authenticated_user(
    store: &Arc<dyn RecordStore>,
    headers: &HeaderMap,
) -> Result<User, Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    let Some(token) = token else {
        return Err(message_response(
            StatusCode::UNAUTHORIZED,
            "Missing bearer token",
        ));
    };
    match store.find_user_by_session(&token_hash(token)).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(message_response(
            StatusCode::UNAUTHORIZED,
            "Invalid session token",
        )),
        Err(err) => Err(store_error_response(err)),
    }
}

async fn issue_session(store: &Arc<dyn RecordStore>, user_id: Uuid) -> Result<String, StoreError> {
    let token = Uuid::new_v4().simple().to_string();
    store.set_session(user_id, &token_hash(&token)).await?;
    Ok(token)
}

fn token_hash(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("hashing password: {err}"))?;
    Ok(hash.to_string())
}

fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn message_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({"message": message}))).into_response()
}

fn store_error_response(err: StoreError) -> Response {
    match &err {
        StoreError::NotFound => message_response(StatusCode::NOT_FOUND, "Not found"),
        StoreError::DuplicateEmail(_) => {
            message_response(StatusCode::BAD_REQUEST, "User already exists")
        }
        StoreError::Unavailable => {
            message_response(StatusCode::SERVICE_UNAVAILABLE, "Storage unavailable")
        }
        _ => {
            error!(error = %err, "store operation failed");
            message_response(StatusCode::INTERNAL_SERVER_ERROR, "Server error")
        }
    }
}
