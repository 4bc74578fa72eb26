use crate::api::error::ApiError;
use crate::api::AppState;
use crate::auth::{self, Principal};
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SignupBody {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

fn user_json(conn: &Connection, user_id: &str) -> Result<serde_json::Value, ApiError> {
    conn.query_row(
        "SELECT id, email, username, display_name, role FROM users WHERE id = ?",
        [user_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "email": r.get::<_, String>(1)?,
                "username": r.get::<_, Option<String>>(2)?,
                "name": r.get::<_, String>(3)?,
                "role": r.get::<_, String>(4)?,
            }))
        },
    )
    .optional()?
    .ok_or_else(|| ApiError::NotFound("user not found".to_string()))
}

fn signup_user(
    conn: &Connection,
    allowed_domain: &str,
    body: &SignupBody,
) -> Result<serde_json::Value, ApiError> {
    let email = body.email.trim().to_ascii_lowercase();
    let name = body.name.trim();
    if email.is_empty() || name.is_empty() {
        return Err(ApiError::BadRequest("email and name are required".to_string()));
    }
    if !email.ends_with(&format!("@{}", allowed_domain)) {
        return Err(ApiError::BadRequest(format!(
            "sign-up is limited to @{} addresses",
            allowed_domain
        )));
    }

    let existing: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [&email], |r| r.get(0))
        .optional()?;
    let user_id = match existing {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO users(id, email, username, password_hash, display_name, role, created_at)
                 VALUES (?, ?, NULL, NULL, ?, 'member', ?)",
                (&id, &email, name, Utc::now().to_rfc3339()),
            )?;
            id
        }
    };
    user_json(conn, &user_id).map(|user| json!({ "user": user }))
}

fn complete_account(conn: &Connection, body: &CompleteBody) -> Result<serde_json::Value, ApiError> {
    let email = body.email.trim().to_ascii_lowercase();
    let username = body.username.trim();
    if username.is_empty() {
        return Err(ApiError::BadRequest("username must not be empty".to_string()));
    }
    if body.password.len() < 8 {
        return Err(ApiError::BadRequest(
            "password must be at least 8 characters".to_string(),
        ));
    }

    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT id, password_hash FROM users WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((user_id, password_hash)) = row else {
        return Err(ApiError::NotFound("no account for that email".to_string()));
    };
    if password_hash.is_some() {
        return Err(ApiError::Conflict("account is already set up".to_string()));
    }

    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE username = ?",
            [username],
            |r| r.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(ApiError::Conflict("username is already taken".to_string()));
    }

    conn.execute(
        "UPDATE users SET username = ?, password_hash = ? WHERE id = ?",
        (username, auth::hash_password(&body.password), &user_id),
    )?;
    user_json(conn, &user_id).map(|user| json!({ "user": user }))
}

fn login_user(conn: &Connection, body: &LoginBody) -> Result<serde_json::Value, ApiError> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT id, password_hash FROM users WHERE username = ?",
            [body.username.trim()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let denied = || ApiError::BadRequest("invalid username or password".to_string());
    let Some((user_id, Some(password_hash))) = row else {
        return Err(denied());
    };
    if !auth::verify_password(&body.password, &password_hash) {
        return Err(denied());
    }
    let token = auth::mint_session(conn, &user_id)?;
    user_json(conn, &user_id).map(|user| json!({ "token": token, "user": user }))
}

pub async fn signup(
    State(state): State<AppState>,
    Json(body): Json<SignupBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    signup_user(&conn, &state.allowed_domain, &body).map(Json)
}

pub async fn complete(
    State(state): State<AppState>,
    Json(body): Json<CompleteBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    complete_account(&conn, &body).map(Json)
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    login_user(&conn, &body).map(Json)
}

pub async fn logout(
    State(state): State<AppState>,
    _principal: Principal,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    let conn = state.db();
    auth::revoke_session(&conn, token.trim())?;
    Ok(Json(json!({ "success": true })))
}

pub async fn me(principal: Principal) -> Json<serde_json::Value> {
    Json(json!({
        "id": principal.user_id,
        "email": principal.email,
        "name": principal.name,
        "role": principal.role.as_str(),
    }))
}
