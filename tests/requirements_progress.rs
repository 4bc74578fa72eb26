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
    adviser: String,
    member: String,
    _workspace: TempDir,
}

fn portal() -> TestPortal {
    let workspace = tempfile::tempdir().expect("create temp workspace");
    let conn = db::open_db(workspace.path()).expect("open portal db");
    seed_user(&conn, "u-osas", "staff@university.edu", "OSAS Staff", "osas");
    seed_user(&conn, "u-adviser", "adviser@university.edu", "Org Adviser", "adviser");
    seed_user(&conn, "u-member", "member@university.edu", "Member One", "member");
    let osas = auth::mint_session(&conn, "u-osas").expect("mint osas session");
    let adviser = auth::mint_session(&conn, "u-adviser").expect("mint adviser session");
    let member = auth::mint_session(&conn, "u-member").expect("mint member session");
    TestPortal {
        app: api::router(AppState::new(conn, "university.edu")),
        osas,
        adviser,
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

async fn create_org(portal: &TestPortal, username: &str) {
    let (status, body) = call(
        &portal.app,
        "POST",
        "/orgs",
        Some(&portal.osas),
        Some(json!({
            "username": username,
            "name": format!("{} Society", username),
            "email": format!("{}@university.edu", username),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create org: {}", body);
}

async fn seed_catalog(portal: &TestPortal) -> Vec<String> {
    let entries = [
        ("Accreditation", "Constitution and by-laws"),
        ("Accreditation", "List of officers"),
        ("Reports", "Accomplishment report"),
        ("Reports", "Financial report"),
    ];
    let mut ids = Vec::new();
    for (section, title) in entries {
        let (status, body) = call(
            &portal.app,
            "POST",
            "/requirements",
            Some(&portal.osas),
            Some(json!({ "section": section, "title": title })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        ids.push(body["requirement"]["id"].as_str().expect("id").to_string());
    }
    ids
}

#[tokio::test]
async fn catalog_is_grouped_by_section_in_sort_order() {
    let portal = portal();
    seed_catalog(&portal).await;

    let (status, body) = call(&portal.app, "GET", "/requirements", Some(&portal.member), None).await;
    assert_eq!(status, StatusCode::OK);
    let sections = body["sections"].as_array().expect("sections");
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0]["section"], "Accreditation");
    assert_eq!(sections[0]["requirements"].as_array().expect("reqs").len(), 2);
    assert_eq!(sections[1]["section"], "Reports");
    // sort_order auto-increments within the section
    assert_eq!(sections[0]["requirements"][0]["sortOrder"], 0);
    assert_eq!(sections[0]["requirements"][1]["sortOrder"], 1);
}

#[tokio::test]
async fn status_upsert_and_org_view() {
    let portal = portal();
    create_org(&portal, "chess-club").await;
    let ids = seed_catalog(&portal).await;

    let (status, _) = call(
        &portal.app,
        "PUT",
        &format!("/orgs/chess-club/requirements/{}", ids[0]),
        Some(&portal.osas),
        Some(json!({
            "startsAt": "2025-09-01",
            "dueAt": "2025-10-15",
            "submitted": true,
            "graded": true,
            "score": 92.5
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Second write to the same pair updates in place.
    let (status, _) = call(
        &portal.app,
        "PUT",
        &format!("/orgs/chess-club/requirements/{}", ids[0]),
        Some(&portal.osas),
        Some(json!({ "dueAt": "2025-11-01", "submitted": true, "graded": true, "score": 95.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &portal.app,
        "GET",
        "/orgs/chess-club/requirements",
        Some(&portal.member),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rows = body["requirements"].as_array().expect("rows");
    assert_eq!(rows.len(), 4);
    let first = rows.iter().find(|r| r["id"] == ids[0].as_str()).expect("row");
    assert_eq!(first["dueAt"], "2025-11-01");
    assert_eq!(first["score"], 95.0);
    // untouched requirement shows the empty status
    let last = rows.iter().find(|r| r["id"] == ids[3].as_str()).expect("row");
    assert_eq!(last["submitted"], false);
    assert!(last["score"].is_null());
}

#[tokio::test]
async fn graded_without_a_score_is_rejected() {
    let portal = portal();
    create_org(&portal, "chess-club").await;
    let ids = seed_catalog(&portal).await;

    let (status, _) = call(
        &portal.app,
        "PUT",
        &format!("/orgs/chess-club/requirements/{}", ids[0]),
        Some(&portal.osas),
        Some(json!({ "graded": true })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn progress_counts_against_the_whole_catalog() {
    let portal = portal();
    create_org(&portal, "chess-club").await;
    let ids = seed_catalog(&portal).await;

    for (i, id) in ids.iter().take(2).enumerate() {
        let graded = i == 0;
        call(
            &portal.app,
            "PUT",
            &format!("/orgs/chess-club/requirements/{}", id),
            Some(&portal.osas),
            Some(json!({
                "submitted": true,
                "graded": graded,
                "score": if graded { json!(88.0) } else { json!(null) }
            })),
        )
        .await;
    }

    let (status, body) = call(
        &portal.app,
        "GET",
        "/orgs/chess-club/progress",
        Some(&portal.member),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 4);
    assert_eq!(body["submitted"], 2);
    assert_eq!(body["graded"], 1);
    assert_eq!(body["percent"], 25.0);
}

#[tokio::test]
async fn catalog_mutation_is_osas_only() {
    let portal = portal();
    let (status, _) = call(
        &portal.app,
        "POST",
        "/requirements",
        Some(&portal.adviser),
        Some(json!({ "section": "Reports", "title": "Extra" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn delete_removes_entry_and_statuses() {
    let portal = portal();
    create_org(&portal, "chess-club").await;
    let ids = seed_catalog(&portal).await;
    call(
        &portal.app,
        "PUT",
        &format!("/orgs/chess-club/requirements/{}", ids[0]),
        Some(&portal.osas),
        Some(json!({ "submitted": true })),
    )
    .await;

    let (status, _) = call(
        &portal.app,
        "DELETE",
        &format!("/requirements/{}", ids[0]),
        Some(&portal.osas),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&portal.app, "GET", "/orgs/chess-club/progress", Some(&portal.member), None).await;
    assert_eq!(body["total"], 3);
    assert_eq!(body["submitted"], 0);
}
