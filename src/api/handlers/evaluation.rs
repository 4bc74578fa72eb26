use crate::api::error::ApiError;
use crate::api::handlers::orgs::require_org;
use crate::api::AppState;
use crate::auth::Principal;
use crate::evaluation::{self, Answer, Question, QuestionKind, QuestionSpec};
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct TemplateBody {
    pub title: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReplaceQuestionsBody {
    pub questions: Vec<QuestionSpec>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseBody {
    pub answers: HashMap<String, Answer>,
    #[serde(default)]
    pub submitted: bool,
}

struct OrgEvaluation {
    id: String,
    org_username: String,
    template_id: String,
    school_year: Option<String>,
    active: bool,
    archived: bool,
    created_at: String,
}

impl OrgEvaluation {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "orgUsername": self.org_username,
            "templateId": self.template_id,
            "schoolYear": self.school_year,
            "active": self.active,
            "archived": self.archived,
            "createdAt": self.created_at,
        })
    }
}

fn template_json(conn: &Connection, template_id: &str) -> Result<Option<serde_json::Value>, ApiError> {
    let row = conn
        .query_row(
            "SELECT id, title, instructions, active, created_at
             FROM evaluation_templates WHERE id = ?",
            [template_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "title": r.get::<_, String>(1)?,
                    "instructions": r.get::<_, String>(2)?,
                    "active": r.get::<_, i64>(3)? != 0,
                    "createdAt": r.get::<_, String>(4)?,
                }))
            },
        )
        .optional()?;
    Ok(row)
}

fn require_template(conn: &Connection, template_id: &str) -> Result<(), ApiError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM evaluation_templates WHERE id = ?",
            [template_id],
            |r| r.get(0),
        )
        .optional()?;
    if found.is_none() {
        return Err(ApiError::NotFound(format!("template '{}' not found", template_id)));
    }
    Ok(())
}

/// The configured template, via the single-row pointer. A dangling or unset
/// pointer is the valid "no evaluation configured" state, not an error.
fn active_template_id(conn: &Connection) -> Result<Option<String>, ApiError> {
    let pointed: Option<String> = conn.query_row(
        "SELECT active_template_id FROM portal_config WHERE id = 1",
        [],
        |r| r.get(0),
    )?;
    let Some(template_id) = pointed else {
        return Ok(None);
    };
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM evaluation_templates WHERE id = ?",
            [&template_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(exists.map(|_| template_id))
}

fn load_questions(
    conn: &Connection,
    template_id: &str,
    active_only: bool,
) -> Result<Vec<Question>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, kind, text, options, scale, sort_order
         FROM evaluation_template_questions
         WHERE template_id = ?{}
         ORDER BY sort_order",
        if active_only { " AND active = 1" } else { "" }
    ))?;
    let rows = stmt
        .query_map([template_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<i64>>(4)?,
                r.get::<_, i64>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut questions = Vec::with_capacity(rows.len());
    for (id, kind_raw, text, options_raw, scale, sort_order) in rows {
        let Some(kind) = QuestionKind::parse(&kind_raw) else {
            // A row written before the kind set was closed; skip rather than
            // fail the whole read.
            continue;
        };
        let options = match options_raw {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| ApiError::Store(format!("corrupt options for question {}: {}", id, e)))?,
            None => Vec::new(),
        };
        questions.push(Question {
            id,
            kind,
            text,
            options,
            scale,
            sort_order,
        });
    }
    Ok(questions)
}

fn load_active_questions(conn: &Connection, template_id: &str) -> Result<Vec<Question>, ApiError> {
    load_questions(conn, template_id, true)
}

fn question_json(q: &Question) -> serde_json::Value {
    json!({
        "id": q.id,
        "type": q.kind.as_str(),
        "text": q.text,
        "options": if q.kind.needs_options() { json!(q.options) } else { serde_json::Value::Null },
        "scale": q.scale,
        "sortOrder": q.sort_order,
    })
}

fn load_org_evaluation(conn: &Connection, id: &str) -> Result<Option<OrgEvaluation>, ApiError> {
    let row = conn
        .query_row(
            "SELECT id, org_username, template_id, school_year, active, archived, created_at
             FROM org_evaluations WHERE id = ?",
            [id],
            |r| {
                Ok(OrgEvaluation {
                    id: r.get(0)?,
                    org_username: r.get(1)?,
                    template_id: r.get(2)?,
                    school_year: r.get(3)?,
                    active: r.get::<_, i64>(4)? != 0,
                    archived: r.get::<_, i64>(5)? != 0,
                    created_at: r.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn load_active_org_evaluation(
    conn: &Connection,
    orgname: &str,
) -> Result<Option<OrgEvaluation>, ApiError> {
    let row = conn
        .query_row(
            "SELECT id, org_username, template_id, school_year, active, archived, created_at
             FROM org_evaluations WHERE org_username = ? AND active = 1",
            [orgname],
            |r| {
                Ok(OrgEvaluation {
                    id: r.get(0)?,
                    org_username: r.get(1)?,
                    template_id: r.get(2)?,
                    school_year: r.get(3)?,
                    active: r.get::<_, i64>(4)? != 0,
                    archived: r.get::<_, i64>(5)? != 0,
                    created_at: r.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}

// ---- template management -------------------------------------------------

pub async fn list_templates(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    let conn = state.db();
    let mut stmt = conn.prepare(
        "SELECT id, title, instructions, active, created_at
         FROM evaluation_templates ORDER BY created_at DESC",
    )?;
    let templates = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "instructions": r.get::<_, String>(2)?,
                "active": r.get::<_, i64>(3)? != 0,
                "createdAt": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(Json(json!({ "templates": templates })))
}

pub async fn create_template(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<TemplateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    let title = body.title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }
    let conn = state.db();
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO evaluation_templates(id, title, instructions, active, created_at)
         VALUES (?, ?, ?, 0, ?)",
        (
            &id,
            title,
            body.instructions.as_deref().unwrap_or(""),
            Utc::now().to_rfc3339(),
        ),
    )?;
    let template = template_json(&conn, &id)?;
    Ok(Json(json!({ "template": template })))
}

/// Flip the current-template pointer. Pointer and active flags move together
/// in one transaction so a reader never sees two active templates.
pub async fn activate_template(
    State(state): State<AppState>,
    principal: Principal,
    Path(template_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    let conn = state.db();
    require_template(&conn, &template_id)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("UPDATE evaluation_templates SET active = 0 WHERE active = 1", [])?;
    tx.execute(
        "UPDATE evaluation_templates SET active = 1 WHERE id = ?",
        [&template_id],
    )?;
    tx.execute(
        "UPDATE portal_config SET active_template_id = ? WHERE id = 1",
        [&template_id],
    )?;
    tx.commit()?;

    let template = template_json(&conn, &template_id)?;
    Ok(Json(json!({ "template": template })))
}

/// Two-phase question replacement: the whole batch is validated before any
/// write, then the old active set is deactivated and the new batch inserted
/// inside one transaction. Old rows survive inactive so historical responses
/// can still reference them by id.
pub async fn replace_questions(
    State(state): State<AppState>,
    principal: Principal,
    Path(template_id): Path<String>,
    Json(body): Json<ReplaceQuestionsBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    let conn = state.db();
    require_template(&conn, &template_id)?;
    evaluation::validate_question_batch(&body.questions)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE evaluation_template_questions SET active = 0 WHERE template_id = ? AND active = 1",
        [&template_id],
    )?;
    for (index, spec) in body.questions.iter().enumerate() {
        let kind = QuestionKind::parse(&spec.kind)
            .ok_or_else(|| ApiError::BadRequest(format!("question {}: bad type", index)))?;
        let options = if kind.needs_options() {
            Some(serde_json::to_string(spec.options.as_deref().unwrap_or(&[])).map_err(
                |e| ApiError::BadRequest(format!("question {}: {}", index, e)),
            )?)
        } else {
            None
        };
        let scale = if kind.needs_scale() { spec.scale } else { None };
        tx.execute(
            "INSERT INTO evaluation_template_questions
                (id, template_id, kind, text, options, scale, sort_order, active)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
            (
                Uuid::new_v4().to_string(),
                &template_id,
                kind.as_str(),
                spec.text.trim(),
                options,
                scale,
                spec.sort_order.unwrap_or(index as i64),
            ),
        )?;
    }
    tx.commit()?;
    Ok(Json(json!({ "success": true })))
}

pub async fn active_template(
    State(state): State<AppState>,
    _principal: Principal,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    let Some(template_id) = active_template_id(&conn)? else {
        return Ok(Json(json!({ "template": null, "questions": [] })));
    };
    let template = template_json(&conn, &template_id)?;
    let questions: Vec<_> = load_active_questions(&conn, &template_id)?
        .iter()
        .map(question_json)
        .collect();
    Ok(Json(json!({ "template": template, "questions": questions })))
}

// ---- per-org evaluation cycles -------------------------------------------

pub async fn org_active_evaluation(
    State(state): State<AppState>,
    _principal: Principal,
    Path(orgname): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    require_org(&conn, &orgname)?;
    let evaluation = load_active_org_evaluation(&conn, &orgname)?;
    Ok(Json(json!({ "evaluation": evaluation.map(|e| e.to_json()) })))
}

/// Idempotent "ensure an active evaluation exists". Two concurrent creators
/// both land on the same row: the loser's insert trips the partial unique
/// index and re-reads the winner.
pub async fn create_org_evaluation(
    State(state): State<AppState>,
    principal: Principal,
    Path(orgname): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    let conn = state.db();
    require_org(&conn, &orgname)?;

    if let Some(existing) = load_active_org_evaluation(&conn, &orgname)? {
        return Ok(Json(json!({ "evaluation": existing.to_json() })));
    }
    let Some(template_id) = active_template_id(&conn)? else {
        return Err(ApiError::BadRequest(
            "no active evaluation template is configured".to_string(),
        ));
    };

    let id = Uuid::new_v4().to_string();
    let insert = conn.execute(
        "INSERT INTO org_evaluations(id, org_username, template_id, school_year, active, archived, created_at)
         VALUES (?, ?, ?, NULL, 1, 0, ?)",
        (&id, &orgname, &template_id, Utc::now().to_rfc3339()),
    );
    match insert {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            // Lost the race; the winner's instance is the one to return.
        }
        Err(e) => return Err(e.into()),
    }
    let evaluation = load_active_org_evaluation(&conn, &orgname)?
        .ok_or_else(|| ApiError::Store("evaluation vanished after create".to_string()))?;
    Ok(Json(json!({ "evaluation": evaluation.to_json() })))
}

/// Cycle close: the active instance becomes archived and a new cycle can be
/// created later. Responses stay attached to the archived instance.
pub async fn archive_org_evaluation(
    State(state): State<AppState>,
    principal: Principal,
    Path(orgname): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_configure() {
        return Err(ApiError::forbidden_role());
    }
    let conn = state.db();
    require_org(&conn, &orgname)?;
    let Some(evaluation) = load_active_org_evaluation(&conn, &orgname)? else {
        return Err(ApiError::NotFound(format!(
            "no active evaluation for '{}'",
            orgname
        )));
    };
    conn.execute(
        "UPDATE org_evaluations SET active = 0, archived = 1 WHERE id = ?",
        [&evaluation.id],
    )?;
    let archived = load_org_evaluation(&conn, &evaluation.id)?
        .ok_or_else(|| ApiError::Store("evaluation vanished after archive".to_string()))?;
    Ok(Json(json!({ "evaluation": archived.to_json() })))
}

// ---- responses -----------------------------------------------------------

pub async fn instance_questions(
    State(state): State<AppState>,
    _principal: Principal,
    Path(org_evaluation_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    let Some(evaluation) = load_org_evaluation(&conn, &org_evaluation_id)? else {
        return Err(ApiError::NotFound(format!(
            "evaluation '{}' not found",
            org_evaluation_id
        )));
    };
    let questions: Vec<_> = load_active_questions(&conn, &evaluation.template_id)?
        .iter()
        .map(question_json)
        .collect();
    Ok(Json(json!({ "questions": questions })))
}

fn response_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let answers_raw: String = r.get(5)?;
    let answers: serde_json::Value =
        serde_json::from_str(&answers_raw).unwrap_or(serde_json::Value::Null);
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "orgEvaluationId": r.get::<_, String>(1)?,
        "orgUsername": r.get::<_, String>(2)?,
        "memberId": r.get::<_, String>(3)?,
        "respondentEmail": r.get::<_, String>(4)?,
        "answers": answers,
        "submitted": r.get::<_, i64>(6)? != 0,
        "updatedAt": r.get::<_, String>(7)?,
    }))
}

const RESPONSE_COLUMNS: &str = "id, org_evaluation_id, org_username, member_id, \
     respondent_email, answers, submitted, updated_at";

pub async fn get_response(
    State(state): State<AppState>,
    _principal: Principal,
    Path((org_evaluation_id, member_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    let Some(_) = load_org_evaluation(&conn, &org_evaluation_id)? else {
        return Err(ApiError::NotFound(format!(
            "evaluation '{}' not found",
            org_evaluation_id
        )));
    };
    // "Not answered yet" is a valid state, not an error.
    let response = conn
        .query_row(
            &format!(
                "SELECT {} FROM org_evaluation_responses
                 WHERE org_evaluation_id = ? AND member_id = ?",
                RESPONSE_COLUMNS
            ),
            (&org_evaluation_id, &member_id),
            response_json,
        )
        .optional()?;
    Ok(Json(json!({ "response": response })))
}

pub async fn put_response(
    State(state): State<AppState>,
    principal: Principal,
    Path((org_evaluation_id, member_id)): Path<(String, String)>,
    Json(body): Json<ResponseBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db();
    let Some(instance) = load_org_evaluation(&conn, &org_evaluation_id)? else {
        return Err(ApiError::NotFound(format!(
            "evaluation '{}' not found",
            org_evaluation_id
        )));
    };

    let member_org: Option<String> = conn
        .query_row(
            "SELECT org_username FROM members WHERE id = ?",
            [&member_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(member_org) = member_org else {
        return Err(ApiError::NotFound(format!("member '{}' not found", member_id)));
    };
    if member_org != instance.org_username {
        return Err(ApiError::BadRequest(
            "member does not belong to this evaluation's organization".to_string(),
        ));
    }

    // Keys are checked against every question row the template has ever
    // had, so a draft keyed by a since-retired question still lands; only
    // the required-field check binds to the current active set.
    let known = load_questions(&conn, &instance.template_id, false)?;
    evaluation::validate_answer_shapes(&known, &body.answers)?;
    if body.submitted {
        let active = load_active_questions(&conn, &instance.template_id)?;
        let failures = evaluation::missing_required(&active, &body.answers);
        if !failures.is_empty() {
            return Err(ApiError::BadRequest(failures.join("; ")));
        }
    }

    // Finalize-lock: once submitted, only osas may write again (the re-open
    // path for corrections).
    let already_submitted: Option<i64> = conn
        .query_row(
            "SELECT submitted FROM org_evaluation_responses
             WHERE org_evaluation_id = ? AND member_id = ?",
            (&org_evaluation_id, &member_id),
            |r| r.get(0),
        )
        .optional()?;
    if already_submitted == Some(1) && !principal.role.can_configure() {
        return Err(ApiError::Conflict("response has already been submitted".to_string()));
    }

    let answers_raw = serde_json::to_string(&body.answers)
        .map_err(|e| ApiError::BadRequest(format!("answers not serializable: {}", e)))?;
    // Org slug comes from the instance and the email from the session, so
    // the caller cannot write into another organization's evaluation.
    conn.execute(
        "INSERT INTO org_evaluation_responses
            (id, org_evaluation_id, org_username, member_id, respondent_email,
             answers, submitted, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(org_evaluation_id, member_id) DO UPDATE SET
            answers = excluded.answers,
            submitted = excluded.submitted,
            respondent_email = excluded.respondent_email,
            updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &org_evaluation_id,
            &instance.org_username,
            &member_id,
            &principal.email,
            &answers_raw,
            body.submitted as i64,
            Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(Json(json!({ "success": true })))
}

pub async fn list_responses(
    State(state): State<AppState>,
    principal: Principal,
    Path(org_evaluation_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.role.can_review() {
        return Err(ApiError::forbidden_role());
    }
    let conn = state.db();
    let Some(_) = load_org_evaluation(&conn, &org_evaluation_id)? else {
        return Err(ApiError::NotFound(format!(
            "evaluation '{}' not found",
            org_evaluation_id
        )));
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM org_evaluation_responses
         WHERE org_evaluation_id = ? ORDER BY updated_at",
        RESPONSE_COLUMNS
    ))?;
    let responses = stmt
        .query_map([&org_evaluation_id], response_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(Json(json!({ "responses": responses })))
}
