pub mod error;
pub mod handlers;

use axum::routing::{delete, get, post, put};
use axum::Router;
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared state behind every handler. The store connection is a single
/// SQLite handle; requests take it for the duration of their store work,
/// which keeps cross-statement sequences (deactivate-then-insert,
/// lookup-then-create) serialized within one process.
#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Connection>>,
    pub allowed_domain: String,
}

impl AppState {
    pub fn new(conn: Connection, allowed_domain: impl Into<String>) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            allowed_domain: allowed_domain.into(),
        }
    }

    pub fn db(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/auth/signup", post(handlers::auth::signup))
        .route("/auth/complete", post(handlers::auth::complete))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/me", get(handlers::auth::me))
        .route(
            "/orgs",
            get(handlers::orgs::list_orgs).post(handlers::orgs::create_org),
        )
        .route(
            "/orgs/{orgname}",
            get(handlers::orgs::get_org).put(handlers::orgs::update_org),
        )
        .route(
            "/orgs/{orgname}/members",
            get(handlers::orgs::list_members).put(handlers::orgs::upsert_members),
        )
        .route(
            "/evaluation-template",
            get(handlers::evaluation::list_templates).post(handlers::evaluation::create_template),
        )
        .route(
            "/evaluation-template/active",
            get(handlers::evaluation::active_template),
        )
        .route(
            "/evaluation-template/{templateId}/activate",
            post(handlers::evaluation::activate_template),
        )
        .route(
            "/evaluation-template/{templateId}/questions",
            put(handlers::evaluation::replace_questions),
        )
        .route(
            "/orgs/{orgname}/evaluations/active",
            get(handlers::evaluation::org_active_evaluation),
        )
        .route(
            "/orgs/{orgname}/evaluations/create",
            post(handlers::evaluation::create_org_evaluation),
        )
        .route(
            "/orgs/{orgname}/evaluations/archive",
            post(handlers::evaluation::archive_org_evaluation),
        )
        .route(
            "/org-evaluations/{orgEvaluationId}/questions",
            get(handlers::evaluation::instance_questions),
        )
        .route(
            "/org-evaluations/{orgEvaluationId}/responses",
            get(handlers::evaluation::list_responses),
        )
        .route(
            "/org-evaluations/{orgEvaluationId}/responses/{memberId}",
            get(handlers::evaluation::get_response).put(handlers::evaluation::put_response),
        )
        .route(
            "/requirements",
            get(handlers::requirements::list_catalog).post(handlers::requirements::create_requirement),
        )
        .route(
            "/requirements/{requirementId}",
            put(handlers::requirements::update_requirement)
                .delete(handlers::requirements::delete_requirement),
        )
        .route(
            "/orgs/{orgname}/requirements",
            get(handlers::requirements::org_statuses),
        )
        .route(
            "/orgs/{orgname}/requirements/{requirementId}",
            put(handlers::requirements::upsert_status),
        )
        .route(
            "/orgs/{orgname}/progress",
            get(handlers::requirements::org_progress),
        )
        .route(
            "/orgs/{orgname}/requirements/{requirementId}/comments",
            get(handlers::comments::list_requirement_comments)
                .post(handlers::comments::create_requirement_comment),
        )
        .route(
            "/org-evaluations/{orgEvaluationId}/comments",
            get(handlers::comments::list_evaluation_comments)
                .post(handlers::comments::create_evaluation_comment),
        )
        .route("/comments/{commentId}", delete(handlers::comments::delete_comment))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
