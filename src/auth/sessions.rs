// Admin session management: argon2 password verification, opaque session
// tokens (stored hashed), idle expiry and an hourly sweeper.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::extract::State;
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::SessionPrincipal;
use crate::error::ApiError;
use crate::state::AppState;

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::internal(format!("password hashing failed: {e}")))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn new_session_token() -> String {
    let mut raw = [0u8; 32];
    rand::rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

fn session_token_hash(token: &str) -> String {
    crate::auth::keys::hash_token(token)
}

/// Seed the owner organization and admin user on first start. A no-op when
/// any user already exists.
pub async fn seed_bootstrap_admin(db: &PgPool, config: &crate::config::Config) -> anyhow::Result<()> {
    let user_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(db)
        .await?;
    if user_count > 0 {
        return Ok(());
    }

    let (Some(username), Some(password)) = (
        config.bootstrap_admin_user.as_deref(),
        config.bootstrap_admin_password.as_deref(),
    ) else {
        tracing::warn!(
            "No users exist and BOOTSTRAP_ADMIN_USER/BOOTSTRAP_ADMIN_PASSWORD are unset — \
             admin API is unreachable until a user is seeded"
        );
        return Ok(());
    };

    let org_id: Uuid = sqlx::query_scalar(
        "INSERT INTO organizations (name) VALUES ('default') \
         ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING id",
    )
    .fetch_one(db)
    .await?;

    let hash = hash_password(password).map_err(|e| anyhow::anyhow!("{e}"))?;
    sqlx::query(
        "INSERT INTO users (username, password_hash, role, org_id) VALUES ($1, $2, 'admin', $3)",
    )
    .bind(username)
    .bind(hash)
    .bind(org_id)
    .execute(db)
    .await?;

    tracing::info!(username = %username, "Bootstrap admin user seeded");
    Ok(())
}

/// Resolve a bearer session token to its user. Expired rows authenticate
/// as missing.
pub async fn authenticate_session(
    state: &AppState,
    token: &str,
) -> Result<SessionPrincipal, ApiError> {
    let hash = session_token_hash(token);
    let row: Option<(Uuid, String, String, DateTime<Utc>)> = sqlx::query_as(
        "SELECT u.id, u.username, u.role, s.expires_at \
         FROM sessions s JOIN users u ON u.id = s.user_id \
         WHERE s.token_hash = $1",
    )
    .bind(&hash)
    .fetch_optional(&state.db)
    .await?;

    let (user_id, username, role, expires_at) =
        row.ok_or_else(|| ApiError::Authentication("Invalid session".to_string()))?;

    if Utc::now() >= expires_at {
        let _ = sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
            .bind(&hash)
            .execute(&state.db)
            .await;
        return Err(ApiError::Authentication("Session expired".to_string()));
    }

    Ok(SessionPrincipal {
        user_id,
        username,
        is_admin: role == "admin",
    })
}

pub async fn cleanup_expired(db: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at < now()")
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

// ── Handlers ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// POST /auth/login — verify credentials, mint a session token.
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    let row: Option<(Uuid, String)> =
        sqlx::query_as("SELECT id, password_hash FROM users WHERE username = $1")
            .bind(&body.username)
            .fetch_optional(&state.db)
            .await?;

    // Verify against a dummy hash on unknown users so response timing does
    // not reveal whether the username exists.
    let (user_id, password_ok) = match row {
        Some((id, stored)) => (Some(id), verify_password(&body.password, &stored)),
        None => {
            let _ = verify_password(&body.password, DUMMY_HASH);
            (None, false)
        }
    };

    let Some(user_id) = user_id.filter(|_| password_ok) else {
        return Err(ApiError::Authentication("Invalid username or password".to_string()));
    };

    let token = new_session_token();
    let expires_at = Utc::now()
        + chrono::Duration::from_std(state.config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));

    sqlx::query("INSERT INTO sessions (token_hash, user_id, expires_at) VALUES ($1, $2, $3)")
        .bind(session_token_hash(&token))
        .bind(user_id)
        .bind(expires_at)
        .execute(&state.db)
        .await?;

    tracing::info!(username = %body.username, "session opened");
    Ok(Json(json!({ "token": token, "expires_at": expires_at })))
}

/// POST /auth/logout — revoke the presented session.
pub async fn logout(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let token = crate::auth::bearer_token(&headers)
        .ok_or_else(|| ApiError::Authentication("Missing session token".to_string()))?;

    let result = sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
        .bind(session_token_hash(token))
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "logged_out": result.rows_affected() > 0 })))
}

/// Argon2 hash of an unguessable string, used to equalize timing for
/// unknown usernames.
const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$aW52YWxpZHNhbHQ$\
c29tZXRoaW5nbm90YXJlYWxoYXNoMDAwMDAwMDAwMDA";
