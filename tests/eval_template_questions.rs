use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use orgportald::api::{self, AppState};
use orgportald::{auth, db};
use rusqlite::Connection;
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestPortal {
    app: Router,
    osas: String,
    member: String,
    _workspace: TempDir,
}

fn portal() -> TestPortal {
    let workspace = tempfile::tempdir().expect("create temp workspace");
    let conn = db::open_db(workspace.path()).expect("open portal db");
    seed_user(&conn, "u-osas", "staff@university.edu", "OSAS Staff", "osas");
    seed_user(&conn, "u-member", "member@university.edu", "Member One", "member");
    let osas = auth::mint_session(&conn, "u-osas").expect("mint osas session");
    let member = auth::mint_session(&conn, "u-member").expect("mint member session");
    TestPortal {
        app: api::router(AppState::new(conn, "university.edu")),
        osas,
        member,
        _workspace: workspace,
    }
}

fn seed_user(conn: &Connection, id: &str, email: &str, name: &str, role: &str) {
    conn.execute(
        "INSERT INTO users(id, email, username, password_hash, display_name, role, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        (
            id,
            email,
            email.split('@').next().unwrap_or(id),
            auth::hash_password("correct horse"),
            name,
            role,
            "2025-08-01T00:00:00Z",
        ),
    )
    .expect("seed user");
}

async fn call(
    app: &Router,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json).expect("encode body")))
            .expect("build request"),
        None => builder.body(Body::empty()).expect("build request"),
    };
    let response = app.clone().oneshot(request).await.expect("dispatch request");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("parse response json")
    };
    (status, value)
}

/// Create a template with a standard three-question set and activate it.
/// Returns the template id.
async fn create_active_template(portal: &TestPortal) -> String {
    let (status, body) = call(
        &portal.app,
        "POST",
        "/evaluation-template",
        Some(&portal.osas),
        Some(json!({ "title": "Year-End Evaluation" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create template: {}", body);
    let template_id = body["template"]["id"].as_str().expect("template id").to_string();

    let (status, body) = call(
        &portal.app,
        "PUT",
        &format!("/evaluation-template/{}/questions", template_id),
        Some(&portal.osas),
        Some(json!({
            "questions": [
                { "type": "input", "text": "What went well this year?" },
                { "type": "checkbox", "text": "Which events did you attend?",
                  "options": ["orientation", "fair", "outreach"] },
                { "type": "likert", "text": "Rate the adviser support", "scale": 5 },
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "replace questions: {}", body);

    let (status, body) = call(
        &portal.app,
        "POST",
        &format!("/evaluation-template/{}/activate", template_id),
        Some(&portal.osas),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "activate template: {}", body);
    template_id
}

#[tokio::test]
async fn active_template_is_a_valid_empty_state() {
    let portal = portal();
    let (status, body) = call(
        &portal.app,
        "GET",
        "/evaluation-template/active",
        Some(&portal.member),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["template"].is_null());
    assert_eq!(body["questions"], json!([]));
}

#[tokio::test]
async fn activation_flips_the_pointer_and_serves_ordered_questions() {
    let portal = portal();
    create_active_template(&portal).await;

    let (status, body) = call(
        &portal.app,
        "GET",
        "/evaluation-template/active",
        Some(&portal.member),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["template"]["title"], "Year-End Evaluation");
    let questions = body["questions"].as_array().expect("questions");
    assert_eq!(questions.len(), 3);
    // sort_order defaults to array index
    assert_eq!(questions[0]["type"], "input");
    assert_eq!(questions[1]["type"], "checkbox");
    assert_eq!(
        questions[1]["options"],
        json!(["orientation", "fair", "outreach"])
    );
    assert_eq!(questions[2]["type"], "likert");
    assert_eq!(questions[2]["scale"], 5);
    for (i, q) in questions.iter().enumerate() {
        assert_eq!(q["sortOrder"], i as i64);
    }
}

#[tokio::test]
async fn bad_batches_are_rejected_before_any_write() {
    let portal = portal();
    let template_id = create_active_template(&portal).await;

    let bad_batches = [
        json!({ "questions": [{ "type": "slider", "text": "Rate us" }] }),
        json!({ "questions": [{ "type": "dropdown", "text": "Pick one" }] }),
        json!({ "questions": [{ "type": "checkbox", "text": "Pick many", "options": [] }] }),
        json!({ "questions": [{ "type": "likert", "text": "Rate", "scale": 1 }] }),
        json!({ "questions": [{ "type": "likert", "text": "Rate", "scale": 11 }] }),
        json!({ "questions": [{ "type": "input", "text": "   " }] }),
    ];
    for batch in bad_batches {
        let (status, body) = call(
            &portal.app,
            "PUT",
            &format!("/evaluation-template/{}/questions", template_id),
            Some(&portal.osas),
            Some(batch.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "batch {} got {}", batch, body);
        assert!(body["error"].is_string());
    }

    // The previously active set survived every rejected batch.
    let (_, body) = call(
        &portal.app,
        "GET",
        "/evaluation-template/active",
        Some(&portal.member),
        None,
    )
    .await;
    assert_eq!(body["questions"].as_array().expect("questions").len(), 3);
}

#[tokio::test]
async fn replacement_requires_the_osas_role_and_makes_no_mutation_otherwise() {
    let portal = portal();
    let template_id = create_active_template(&portal).await;

    let attempt = json!({ "questions": [{ "type": "input", "text": "Hijacked?" }] });
    let (status, _) = call(
        &portal.app,
        "PUT",
        &format!("/evaluation-template/{}/questions", template_id),
        Some(&portal.member),
        Some(attempt.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &portal.app,
        "PUT",
        &format!("/evaluation-template/{}/questions", template_id),
        None,
        Some(attempt),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, body) = call(
        &portal.app,
        "GET",
        "/evaluation-template/active",
        Some(&portal.member),
        None,
    )
    .await;
    let questions = body["questions"].as_array().expect("questions");
    assert_eq!(questions.len(), 3);
    assert_eq!(questions[0]["text"], "What went well this year?");
}

#[tokio::test]
async fn replacement_supersedes_rather_than_deletes() {
    let portal = portal();
    let template_id = create_active_template(&portal).await;

    let (status, _) = call(
        &portal.app,
        "PUT",
        &format!("/evaluation-template/{}/questions", template_id),
        Some(&portal.osas),
        Some(json!({
            "questions": [
                { "type": "input", "text": "One question now", "sortOrder": 7 },
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(
        &portal.app,
        "GET",
        "/evaluation-template/active",
        Some(&portal.member),
        None,
    )
    .await;
    let questions = body["questions"].as_array().expect("questions");
    assert_eq!(questions.len(), 1);
    assert_eq!(questions[0]["text"], "One question now");
    assert_eq!(questions[0]["sortOrder"], 7);
}

#[tokio::test]
async fn unknown_template_is_a_404() {
    let portal = portal();
    let (status, _) = call(
        &portal.app,
        "PUT",
        "/evaluation-template/nope/questions",
        Some(&portal.osas),
        Some(json!({ "questions": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
