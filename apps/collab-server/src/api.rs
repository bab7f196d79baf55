//! Document and user REST endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Duration;
use collab::store::{verify_password, StoreError};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::auth::AuthUser;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateDocumentRequest {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct ShareDocumentRequest {
    pub email: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "editor".to_string()
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    if req.email.is_empty() || req.password.is_empty() {
        return (StatusCode::BAD_REQUEST, "email and password are required").into_response();
    }

    match state.store.create_user(&req.email, &req.password).await {
        Ok(user) => (
            StatusCode::CREATED,
            Json(UserResponse {
                id: user.id,
                email: user.email,
            }),
        )
            .into_response(),
        Err(err @ StoreError::EmailTaken(_)) => {
            (StatusCode::CONFLICT, err.to_string()).into_response()
        }
        Err(err) => {
            error!(%err, "failed to create user");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Response {
    let user = match state.store.get_user_by_email(&req.email).await {
        Ok(user) => user,
        Err(_) => return (StatusCode::UNAUTHORIZED, "Invalid credentials").into_response(),
    };
    if !verify_password(&req.password, &user.password_hash) {
        return (StatusCode::UNAUTHORIZED, "Invalid credentials").into_response();
    }

    match state
        .store
        .create_token(&user.id, Duration::seconds(state.config.token_ttl_secs))
        .await
    {
        Ok(token) => Json(LoginResponse { token: token.token }).into_response(),
        Err(err) => {
            error!(%err, "failed to create token");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn create_document(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateDocumentRequest>,
) -> Response {
    let title = if req.title.is_empty() {
        "Untitled Document"
    } else {
        req.title.as_str()
    };

    match state.store.create_document(title, &user.id).await {
        Ok(doc) => (StatusCode::CREATED, Json(doc)).into_response(),
        Err(err) => {
            error!(%err, "failed to create document");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Response {
    match state.store.get_document(&document_id).await {
        Ok(doc) => Json(doc).into_response(),
        Err(StoreError::NotFound) => {
            (StatusCode::NOT_FOUND, "Document not found").into_response()
        }
        Err(err) => {
            error!(%err, "failed to load document");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn share_document(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(document_id): Path<String>,
    Json(req): Json<ShareDocumentRequest>,
) -> Response {
    let target = match state.store.get_user_by_email(&req.email).await {
        Ok(target) => target,
        Err(_) => return (StatusCode::NOT_FOUND, "Target user not found").into_response(),
    };

    match state
        .store
        .share_document(&document_id, &user.id, &target.id, &req.role)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err @ StoreError::NotOwner) => {
            (StatusCode::FORBIDDEN, err.to_string()).into_response()
        }
        Err(StoreError::NotFound) => {
            (StatusCode::NOT_FOUND, "Document not found").into_response()
        }
        Err(err) => {
            error!(%err, "failed to share document");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
