use crate::api::error::ApiError;
use crate::api::handlers::orgs::require_org;
use crate::api::AppState;
use crate::auth::Principal;
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

const SUBJECT_REQUIREMENT: &str = "requirement";
const SUBJECT_EVALUATION: &str = "evaluation";

#[derive(Debug, Deserialize)]
pub struct CommentBody {
    pub content: String,
}

fn list_comments(
    conn: &Connection,
    subject_kind: &str,
    subject_id: &str,
    org_username: &str,
) -> Result<serde_json::Value, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT id, org_username, author_email, author_name, content, created_at
         FROM comments
         WHERE subject_kind = ? AND subject_id = ? AND org_username = ?
         ORDER BY created_at",
    )?;
    let comments = stmt
        .query_map((subject_kind, subject_id, org_username), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "orgUsername": r.get::<_, String>(1)?,
                "authorEmail": r.get::<_, String>(2)?,
                "authorName": r.get::<_, String>(3)?,
                "content": r.get::<_, String>(4)?,
                "createdAt": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "comments": comments }))
}

fn insert_comment(
    conn: &Connection,
    principal: &Principal,
    subject_kind: &str,
    subject_id: &str,
    org_username: &str,
    content: &str,
) -> Result<serde_json::Value, ApiError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".to_string()));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO comments
            (id, org_username, subject_kind, subject_id, author_email, author_name,
             content, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            org_username,
            subject_kind,
            subject_id,
            &principal.email,
            &principal.name,
            content,
            Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(json!({ "success": true, "commentId": id }))
}

pub async fn list_requirement_comments(
    State(state): State<AppState>,
    _principal: Principal,
    Path((orgname, requirement_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    require_org(&conn, &orgname)?;
    list_comments(&conn, SUBJECT_REQUIREMENT, &requirement_id, &orgname).map(Json)
}

pub async fn create_requirement_comment(
    State(state): State<AppState>,
    principal: Principal,
    Path((orgname, requirement_id)): Path<(String, String)>,
    Json(body): Json<CommentBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    require_org(&conn, &orgname)?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM requirements WHERE id = ?",
            [&requirement_id],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(ApiError::NotFound(format!(
            "requirement '{}' not found",
            requirement_id
        )));
    }
    insert_comment(
        &conn,
        &principal,
        SUBJECT_REQUIREMENT,
        &requirement_id,
        &orgname,
        &body.content,
    )
    .map(Json)
}

pub async fn list_evaluation_comments(
    State(state): State<AppState>,
    _principal: Principal,
    Path(org_evaluation_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    let org: Option<String> = conn
        .query_row(
            "SELECT org_username FROM org_evaluations WHERE id = ?",
            [&org_evaluation_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(org) = org else {
        return Err(ApiError::NotFound(format!(
            "evaluation '{}' not found",
            org_evaluation_id
        )));
    };
    list_comments(&conn, SUBJECT_EVALUATION, &org_evaluation_id, &org).map(Json)
}

pub async fn create_evaluation_comment(
    State(state): State<AppState>,
    principal: Principal,
    Path(org_evaluation_id): Path<String>,
    Json(body): Json<CommentBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    let org: Option<String> = conn
        .query_row(
            "SELECT org_username FROM org_evaluations WHERE id = ?",
            [&org_evaluation_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(org) = org else {
        return Err(ApiError::NotFound(format!(
            "evaluation '{}' not found",
            org_evaluation_id
        )));
    };
    insert_comment(
        &conn,
        &principal,
        SUBJECT_EVALUATION,
        &org_evaluation_id,
        &org,
        &body.content,
    )
    .map(Json)
}

/// Only the author may delete a comment, regardless of role.
pub async fn delete_comment(
    State(state): State<AppState>,
    principal: Principal,
    Path(comment_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    let author: Option<String> = conn
        .query_row(
            "SELECT author_email FROM comments WHERE id = ?",
            [&comment_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(author) = author else {
        return Err(ApiError::NotFound(format!("comment '{}' not found", comment_id)));
    };
    if author != principal.email {
        return Err(ApiError::Forbidden(
            "only the author may delete a comment".to_string(),
        ));
    }
    conn.execute("DELETE FROM comments WHERE id = ?", [&comment_id])?;
    Ok(Json(json!({ "success": true })))
}
