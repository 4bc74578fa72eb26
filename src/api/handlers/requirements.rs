use crate::api::error::ApiError;
use crate::api::handlers::orgs::require_org;
use crate::api::AppState;
use crate::auth::Principal;
use axum::extract::{Path, State};
use axum::Json;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementBody {
    pub section: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sort_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    #[serde(default)]
    pub starts_at: Option<String>,
    #[serde(default)]
    pub due_at: Option<String>,
    #[serde(default)]
    pub submitted: bool,
    #[serde(default)]
    pub graded: bool,
    #[serde(default)]
    pub score: Option<f64>,
}

fn require_requirement(conn: &Connection, requirement_id: &str) -> Result<(), ApiError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM requirements WHERE id = ?",
            [requirement_id],
            |r| r.get(0),
        )
        .optional()?;
    if found.is_none() {
        return Err(ApiError::NotFound(format!(
            "requirement '{}' not found",
            requirement_id
        )));
    }
    Ok(())
}

fn requirement_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "section": r.get::<_, String>(1)?,
        "title": r.get::<_, String>(2)?,
        "description": r.get::<_, String>(3)?,
        "sortOrder": r.get::<_, i64>(4)?,
    }))
}

/// Catalog grouped by section, in sort order within each group.
pub async fn list_catalog(
    State(state): State<AppState>,
    _principal: Principal,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    let mut stmt = conn.prepare(
        "SELECT id, section, title, description, sort_order
         FROM requirements ORDER BY section, sort_order",
    )?;
    let rows = stmt
        .query_map([], requirement_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut sections: Vec<serde_json::Value> = Vec::new();
    for row in rows {
        let section = row["section"].as_str().unwrap_or("").to_string();
        match sections.last_mut() {
            Some(group) if group["section"] == section.as_str() => {
                if let Some(items) = group["requirements"].as_array_mut() {
                    items.push(row);
                }
            }
            _ => {
                sections.push(json!({ "section": section, "requirements": [row] }));
            }
        }
    }
    Ok(Json(json!({ "sections": sections })))
}

pub async fn create_requirement(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<RequirementBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    let section = body.section.trim();
    let title = body.title.trim();
    if section.is_empty() || title.is_empty() {
        return Err(ApiError::BadRequest(
            "section and title must not be empty".to_string(),
        ));
    }
    let conn = state.db();
    let sort_order = match body.sort_order {
        Some(v) => v,
        None => conn.query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM requirements WHERE section = ?",
            [section],
            |r| r.get(0),
        )?,
    };
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO requirements(id, section, title, description, sort_order)
         VALUES (?, ?, ?, ?, ?)",
        (
            &id,
            section,
            title,
            body.description.as_deref().unwrap_or(""),
            sort_order,
        ),
    )?;
    let requirement = conn.query_row(
        "SELECT id, section, title, description, sort_order FROM requirements WHERE id = ?",
        [&id],
        requirement_json,
    )?;
    Ok(Json(json!({ "requirement": requirement })))
}

pub async fn update_requirement(
    State(state): State<AppState>,
    principal: Principal,
    Path(requirement_id): Path<String>,
    Json(body): Json<RequirementBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    let conn = state.db();
    require_requirement(&conn, &requirement_id)?;
    conn.execute(
        "UPDATE requirements SET section = ?, title = ?, description = ?,
            sort_order = COALESCE(?, sort_order)
         WHERE id = ?",
        (
            body.section.trim(),
            body.title.trim(),
            body.description.as_deref().unwrap_or(""),
            body.sort_order,
            &requirement_id,
        ),
    )?;
    let requirement = conn.query_row(
        "SELECT id, section, title, description, sort_order FROM requirements WHERE id = ?",
        [&requirement_id],
        requirement_json,
    )?;
    Ok(Json(json!({ "requirement": requirement })))
}

pub async fn delete_requirement(
    State(state): State<AppState>,
    principal: Principal,
    Path(requirement_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    let conn = state.db();
    require_requirement(&conn, &requirement_id)?;
    // Status history goes with the catalog entry; comments stay (they carry
    // their own author/content and are pruned independently).
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM org_requirement_statuses WHERE requirement_id = ?",
        [&requirement_id],
    )?;
    tx.execute("DELETE FROM requirements WHERE id = ?", [&requirement_id])?;
    tx.commit()?;
    Ok(Json(json!({ "success": true })))
}

/// Catalog joined with the org's active status rows. A requirement with no
/// status yet comes back with null dates/score and false flags.
pub async fn org_statuses(
    State(state): State<AppState>,
    _principal: Principal,
    Path(orgname): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    require_org(&conn, &orgname)?;
    let mut stmt = conn.prepare(
        "SELECT r.id, r.section, r.title, r.description, r.sort_order,
                s.starts_at, s.due_at, s.submitted, s.graded, s.score
         FROM requirements r
         LEFT JOIN org_requirement_statuses s
           ON s.requirement_id = r.id AND s.org_username = ? AND s.active = 1
         ORDER BY r.section, r.sort_order",
    )?;
    let rows = stmt
        .query_map([&orgname], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "section": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "description": r.get::<_, String>(3)?,
                "sortOrder": r.get::<_, i64>(4)?,
                "startsAt": r.get::<_, Option<String>>(5)?,
                "dueAt": r.get::<_, Option<String>>(6)?,
                "submitted": r.get::<_, Option<i64>>(7)?.unwrap_or(0) != 0,
                "graded": r.get::<_, Option<i64>>(8)?.unwrap_or(0) != 0,
                "score": r.get::<_, Option<f64>>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(Json(json!({ "requirements": rows })))
}

pub async fn upsert_status(
    State(state): State<AppState>,
    principal: Principal,
    Path((orgname, requirement_id)): Path<(String, String)>,
    Json(body): Json<StatusBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    if body.graded && body.score.is_none() {
        return Err(ApiError::BadRequest(
            "a graded requirement needs a score".to_string(),
        ));
    }
    let conn = state.db();
    require_org(&conn, &orgname)?;
    require_requirement(&conn, &requirement_id)?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM org_requirement_statuses
             WHERE org_username = ? AND requirement_id = ? AND active = 1",
            (&orgname, &requirement_id),
            |r| r.get(0),
        )
        .optional()?;
    match existing {
        Some(status_id) => {
            conn.execute(
                "UPDATE org_requirement_statuses
                 SET starts_at = ?, due_at = ?, submitted = ?, graded = ?, score = ?
                 WHERE id = ?",
                (
                    body.starts_at.as_deref(),
                    body.due_at.as_deref(),
                    body.submitted as i64,
                    body.graded as i64,
                    body.score,
                    &status_id,
                ),
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO org_requirement_statuses
                    (id, org_username, requirement_id, starts_at, due_at,
                     submitted, graded, score, active)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)",
                (
                    Uuid::new_v4().to_string(),
                    &orgname,
                    &requirement_id,
                    body.starts_at.as_deref(),
                    body.due_at.as_deref(),
                    body.submitted as i64,
                    body.graded as i64,
                    body.score,
                ),
            )?;
        }
    }
    Ok(Json(json!({ "success": true })))
}

/// Completion progress over the whole catalog, not only requirements that
/// already have a status row.
pub async fn org_progress(
    State(state): State<AppState>,
    _principal: Principal,
    Path(orgname): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    require_org(&conn, &orgname)?;
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM requirements", [], |r| r.get(0))?;
    let (submitted, graded): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(s.submitted), 0), COALESCE(SUM(s.graded), 0)
         FROM org_requirement_statuses s
         JOIN requirements r ON r.id = s.requirement_id
         WHERE s.org_username = ? AND s.active = 1",
        [&orgname],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let percent = if total > 0 {
        (graded as f64 / total as f64) * 100.0
    } else {
        0.0
    };
    Ok(Json(json!({
        "total": total,
        "submitted": submitted,
        "graded": graded,
        "percent": percent,
    })))
}
