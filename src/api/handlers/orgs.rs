use crate::api::error::ApiError;
use crate::api::AppState;
use crate::auth::Principal;
use axum::extract::{Path, Query, State};
use axum::Json;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgBody {
    pub username: Option<String>,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub adviser_email: Option<String>,
    #[serde(default)]
    pub accreditation: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembersBody {
    pub school_year: String,
    pub students: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembersQuery {
    #[serde(default)]
    pub school_year: Option<String>,
}

fn org_json(conn: &Connection, orgname: &str) -> Result<Option<serde_json::Value>, ApiError> {
    let row = conn
        .query_row(
            "SELECT username, name, email, adviser_email, accreditation, avatar_url
             FROM orgs WHERE username = ?",
            [orgname],
            |r| {
                Ok(json!({
                    "username": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "email": r.get::<_, String>(2)?,
                    "adviserEmail": r.get::<_, Option<String>>(3)?,
                    "accreditation": r.get::<_, Option<String>>(4)?,
                    "avatarUrl": r.get::<_, Option<String>>(5)?,
                }))
            },
        )
        .optional()?;
    Ok(row)
}

pub fn require_org(conn: &Connection, orgname: &str) -> Result<(), ApiError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM orgs WHERE username = ?", [orgname], |r| r.get(0))
        .optional()?;
    if found.is_none() {
        return Err(ApiError::NotFound(format!("organization '{}' not found", orgname)));
    }
    Ok(())
}

pub async fn list_orgs(
    State(state): State<AppState>,
    _principal: Principal,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    let mut stmt = conn.prepare(
        "SELECT username, name, email, adviser_email, accreditation, avatar_url
         FROM orgs ORDER BY name",
    )?;
    let orgs = stmt
        .query_map([], |r| {
            Ok(json!({
                "username": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "adviserEmail": r.get::<_, Option<String>>(3)?,
                "accreditation": r.get::<_, Option<String>>(4)?,
                "avatarUrl": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(Json(json!({ "orgs": orgs })))
}

pub async fn create_org(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<OrgBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    let Some(username) = body.username.as_deref().map(str::trim).filter(|s| !s.is_empty())
    else {
        return Err(ApiError::BadRequest("username is required".to_string()));
    };
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::BadRequest(
            "username may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }

    let conn = state.db();
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM orgs WHERE username = ?", [username], |r| r.get(0))
        .optional()?;
    if exists.is_some() {
        return Err(ApiError::Conflict(format!("organization '{}' already exists", username)));
    }
    conn.execute(
        "INSERT INTO orgs(username, name, email, adviser_email, accreditation, avatar_url)
         VALUES (?, ?, ?, ?, ?, ?)",
        (
            username,
            name,
            body.email.trim(),
            body.adviser_email.as_deref(),
            body.accreditation.as_deref(),
            body.avatar_url.as_deref(),
        ),
    )?;
    let org = org_json(&conn, username)?;
    Ok(Json(json!({ "org": org })))
}

pub async fn get_org(
    State(state): State<AppState>,
    _principal: Principal,
    Path(orgname): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    let org = org_json(&conn, &orgname)?
        .ok_or_else(|| ApiError::NotFound(format!("organization '{}' not found", orgname)))?;
    Ok(Json(json!({ "org": org })))
}

pub async fn update_org(
    State(state): State<AppState>,
    principal: Principal,
    Path(orgname): Path<String>,
    Json(body): Json<OrgBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    let conn = state.db();
    require_org(&conn, &orgname)?;
    conn.execute(
        "UPDATE orgs SET name = ?, email = ?, adviser_email = ?, accreditation = ?, avatar_url = ?
         WHERE username = ?",
        (
            body.name.trim(),
            body.email.trim(),
            body.adviser_email.as_deref(),
            body.accreditation.as_deref(),
            body.avatar_url.as_deref(),
            &orgname,
        ),
    )?;
    let org = org_json(&conn, &orgname)?;
    Ok(Json(json!({ "org": org })))
}

pub async fn list_members(
    State(state): State<AppState>,
    _principal: Principal,
    Path(orgname): Path<String>,
    Query(query): Query<MembersQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    require_org(&conn, &orgname)?;

    let mut sql = String::from(
        "SELECT id, student_name, school_year FROM members WHERE org_username = ?",
    );
    if query.school_year.is_some() {
        sql.push_str(" AND school_year = ?");
    }
    sql.push_str(" ORDER BY student_name");

    let mut stmt = conn.prepare(&sql)?;
    let map_row = |r: &rusqlite::Row<'_>| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "studentName": r.get::<_, String>(1)?,
            "schoolYear": r.get::<_, String>(2)?,
        }))
    };
    let members = match &query.school_year {
        Some(year) => stmt
            .query_map((&orgname, year), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?,
        None => stmt
            .query_map([&orgname], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?,
    };
    Ok(Json(json!({ "members": members })))
}

/// Bulk roster upsert, the landing API for the spreadsheet import wrapper.
/// Rows collide on (org, name, year); duplicates are left untouched.
pub async fn upsert_members(
    State(state): State<AppState>,
    principal: Principal,
    Path(orgname): Path<String>,
    Json(body): Json<MembersBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    let school_year = body.school_year.trim();
    if school_year.is_empty() {
        return Err(ApiError::BadRequest("schoolYear must not be empty".to_string()));
    }

    let conn = state.db();
    require_org(&conn, &orgname)?;

    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0usize;
    for raw in &body.students {
        let student_name = raw.trim();
        if student_name.is_empty() {
            continue;
        }
        // execute reports 0 affected rows when the conflict clause skipped
        // the insert, so `count` is rows actually written.
        inserted += tx.execute(
            "INSERT INTO members(id, org_username, student_name, school_year)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(org_username, student_name, school_year) DO NOTHING",
            (
                Uuid::new_v4().to_string(),
                &orgname,
                student_name,
                school_year,
            ),
        )?;
    }
    tx.commit()?;
    Ok(Json(json!({ "success": true, "count": inserted })))
}
