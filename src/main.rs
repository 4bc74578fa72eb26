use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use orgportald::api::{self, AppState};
use orgportald::{auth, db};
use rusqlite::OptionalExtension;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "orgportald", about = "Student-organization portal server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server.
    Serve {
        /// Directory holding the portal database.
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: SocketAddr,
        /// Email domain allowed to sign up.
        #[arg(long, default_value = "university.edu")]
        allowed_domain: String,
    },
    /// Create or update an account directly in the store. This is how
    /// elevated roles (osas, adviser, org) are assigned.
    CreateUser {
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "member")]
        role: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().command {
        Command::Serve {
            workspace,
            addr,
            allowed_domain,
        } => serve(workspace, addr, allowed_domain).await,
        Command::CreateUser {
            workspace,
            email,
            name,
            role,
            username,
            password,
        } => create_user(workspace, email, name, role, username, password),
    }
}

async fn serve(workspace: PathBuf, addr: SocketAddr, allowed_domain: String) -> anyhow::Result<()> {
    let conn = db::open_db(&workspace).context("open portal database")?;
    let app = api::router(AppState::new(conn, allowed_domain));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    tracing::info!(%addr, workspace = %workspace.display(), "orgportald listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")
}

fn create_user(
    workspace: PathBuf,
    email: String,
    name: String,
    role: String,
    username: String,
    password: String,
) -> anyhow::Result<()> {
    let role = auth::Role::parse(&role);
    let conn = db::open_db(&workspace).context("open portal database")?;
    let email = email.trim().to_ascii_lowercase();
    let password_hash = auth::hash_password(&password);

    let existing: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [&email], |r| r.get(0))
        .optional()?;
    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE users SET username = ?, password_hash = ?, display_name = ?, role = ?
                 WHERE id = ?",
                (&username, &password_hash, &name, role.as_str(), &id),
            )?;
            tracing::info!(%email, role = role.as_str(), "updated user");
        }
        None => {
            conn.execute(
                "INSERT INTO users(id, email, username, password_hash, display_name, role, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &email,
                    &username,
                    &password_hash,
                    &name,
                    role.as_str(),
                    Utc::now().to_rfc3339(),
                ),
            )?;
            tracing::info!(%email, role = role.as_str(), "created user");
        }
    }
    Ok(())
}
