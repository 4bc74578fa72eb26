use crate::api::error::ApiError;
use crate::api::AppState;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::Utc;
use pbkdf2::pbkdf2_hmac;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

const PBKDF2_ITERATIONS: u32 = 100_000;

/// Role set is closed. Stored strings outside it collapse to Member when a
/// session is minted, matching how tokens were stamped historically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Member,
    Adviser,
    Osas,
    Org,
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "adviser" => Self::Adviser,
            "osas" => Self::Osas,
            "org" => Self::Org,
            _ => Self::Member,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Adviser => "adviser",
            Self::Osas => "osas",
            Self::Org => "org",
        }
    }

    /// Configuration rights: templates, orgs, requirement catalog, cycles.
    pub fn can_configure(self) -> bool {
        matches!(self, Self::Osas)
    }

    /// Grading/review rights over collected responses.
    pub fn can_review(self) -> bool {
        matches!(self, Self::Osas | Self::Adviser)
    }
}

/// Resolved once per request by the extractor below and handed to handlers.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
}

pub fn hash_password(password: &str) -> String {
    let salt = *Uuid::new_v4().as_bytes();
    let key = derive_key(password, &salt, PBKDF2_ITERATIONS);
    format!(
        "pbkdf2${}${}${}",
        PBKDF2_ITERATIONS,
        B64.encode(salt),
        B64.encode(key)
    )
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some("pbkdf2"), Some(iters), Some(salt_b64), Some(hash_b64)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Ok(iterations) = iters.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (B64.decode(salt_b64), B64.decode(hash_b64)) else {
        return false;
    };
    let key = derive_key(password, &salt, iterations.max(1));
    key.ct_eq(expected.as_slice()).into()
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

/// Mint an opaque bearer token `"{session_id}.{secret}"`. Only the secret's
/// digest is stored, so a leaked database does not leak live sessions.
pub fn mint_session(conn: &Connection, user_id: &str) -> Result<String, rusqlite::Error> {
    let session_id = Uuid::new_v4().as_simple().to_string();
    let secret = format!(
        "{}{}",
        Uuid::new_v4().as_simple(),
        Uuid::new_v4().as_simple()
    );
    let digest = B64.encode(Sha256::digest(secret.as_bytes()));
    conn.execute(
        "INSERT INTO sessions(id, user_id, secret_sha256, created_at) VALUES (?, ?, ?, ?)",
        (&session_id, user_id, &digest, Utc::now().to_rfc3339()),
    )?;
    Ok(format!("{}.{}", session_id, secret))
}

pub fn resolve_session(conn: &Connection, token: &str) -> Result<Option<Principal>, rusqlite::Error> {
    let Some((session_id, secret)) = token.split_once('.') else {
        return Ok(None);
    };
    let row: Option<(String, String, String, String, String)> = conn
        .query_row(
            "SELECT s.secret_sha256, u.id, u.email, u.display_name, u.role
             FROM sessions s JOIN users u ON u.id = s.user_id
             WHERE s.id = ?",
            [session_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()?;
    let Some((stored_digest, user_id, email, name, role)) = row else {
        return Ok(None);
    };
    let digest = B64.encode(Sha256::digest(secret.as_bytes()));
    let matches: bool = digest.as_bytes().ct_eq(stored_digest.as_bytes()).into();
    if !matches {
        return Ok(None);
    }
    Ok(Some(Principal {
        user_id,
        email,
        name,
        role: Role::parse(&role),
    }))
}

pub fn revoke_session(conn: &Connection, token: &str) -> Result<(), rusqlite::Error> {
    if let Some((session_id, _)) = token.split_once('.') {
        conn.execute("DELETE FROM sessions WHERE id = ?", [session_id])?;
    }
    Ok(())
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts) else {
            return Err(ApiError::Unauthorized);
        };
        let conn = state.db();
        resolve_session(&conn, &token)?.ok_or(ApiError::Unauthorized)
    }
}
