// Admin surface: organizations, users, API keys (including self-service),
// model CRUD with lifecycle actions, and runtime config overrides.
// All handlers sit behind the session-auth middleware in lib.rs.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::Row;
use uuid::Uuid;

use crate::auth::keys::{self, Scope};
use crate::auth::Principal;
use crate::error::ApiError;
use crate::lifecycle::{CreateModelRequest, UpdateModelRequest};
use crate::state::AppState;

// ── Organizations ───────────────────────────────────────────────────────

pub async fn list_orgs(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows = sqlx::query("SELECT id, name, created_at FROM organizations ORDER BY created_at")
        .fetch_all(&state.db)
        .await?;
    let orgs: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "id": r.get::<Uuid, _>("id"),
                "name": r.get::<String, _>("name"),
                "created_at": r.get::<DateTime<Utc>, _>("created_at"),
            })
        })
        .collect();
    Ok(Json(json!({ "organizations": orgs })))
}

#[derive(Deserialize)]
pub struct CreateOrgRequest {
    pub name: String,
}

pub async fn create_org(
    State(state): State<AppState>,
    Json(body): Json<CreateOrgRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::InvalidRequest("organization name is required".into()));
    }
    let id: Uuid = sqlx::query_scalar("INSERT INTO organizations (name) VALUES ($1) RETURNING id")
        .bind(body.name.trim())
        .fetch_one(&state.db)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                ApiError::InvalidRequest(format!("organization '{}' already exists", body.name))
            }
            _ => ApiError::Store(e),
        })?;
    Ok(Json(json!({ "id": id, "name": body.name.trim() })))
}

/// Deleting an organization is blocked while it still owns active keys.
pub async fn delete_org(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let active_keys: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM api_keys WHERE org_id = $1 AND revoked_at IS NULL",
    )
    .bind(id)
    .fetch_one(&state.db)
    .await?;
    if active_keys > 0 {
        return Err(ApiError::InvalidRequest(format!(
            "organization has {active_keys} active keys; revoke them first"
        )));
    }
    let result = sqlx::query("DELETE FROM organizations WHERE id = $1")
        .bind(id)
        .execute(&state.db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound("organization not found".into()));
    }
    Ok(Json(json!({ "deleted": true })))
}

// ── Users ───────────────────────────────────────────────────────────────

pub async fn list_users(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows = sqlx::query(
        "SELECT id, username, role, org_id, created_at FROM users ORDER BY created_at",
    )
    .fetch_all(&state.db)
    .await?;
    let users: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "id": r.get::<Uuid, _>("id"),
                "username": r.get::<String, _>("username"),
                "role": r.get::<String, _>("role"),
                "org_id": r.get::<Option<Uuid>, _>("org_id"),
                "created_at": r.get::<DateTime<Utc>, _>("created_at"),
            })
        })
        .collect();
    Ok(Json(json!({ "users": users })))
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub org_id: Option<Uuid>,
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> Result<Json<Value>, ApiError> {
    let role = body.role.as_deref().unwrap_or("user");
    if !["admin", "user"].contains(&role) {
        return Err(ApiError::InvalidRequest(format!("role must be admin or user, got '{role}'")));
    }
    if body.username.trim().is_empty() || body.password.len() < 8 {
        return Err(ApiError::InvalidRequest(
            "username is required and password must be at least 8 characters".into(),
        ));
    }

    let hash = crate::auth::sessions::hash_password(&body.password)?;
    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO users (username, password_hash, role, org_id) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(body.username.trim())
    .bind(hash)
    .bind(role)
    .bind(body.org_id)
    .fetch_one(&state.db)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ApiError::InvalidRequest(format!("username '{}' is taken", body.username))
        }
        _ => ApiError::Store(e),
    })?;

    tracing::info!(username = %body.username, role, "user created");
    Ok(Json(json!({ "id": id, "username": body.username.trim(), "role": role })))
}

/// Role promotion is an explicit event, not part of the generic update.
#[derive(Deserialize)]
pub struct PromoteRequest {
    pub role: String,
}

pub async fn set_user_role(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<PromoteRequest>,
) -> Result<Json<Value>, ApiError> {
    if !["admin", "user"].contains(&body.role.as_str()) {
        return Err(ApiError::InvalidRequest("role must be admin or user".into()));
    }
    let result = sqlx::query("UPDATE users SET role = $1 WHERE id = $2")
        .bind(&body.role)
        .bind(id)
        .execute(&state.db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound("user not found".into()));
    }
    tracing::info!(user_id = %id, role = %body.role, "user role changed");
    Ok(Json(json!({ "id": id, "role": body.role })))
}

// ── API keys ────────────────────────────────────────────────────────────

fn key_row_json(r: &sqlx::postgres::PgRow) -> Value {
    json!({
        "id": r.get::<Uuid, _>("id"),
        "prefix": r.get::<String, _>("prefix"),
        "scopes": r.get::<Vec<String>, _>("scopes"),
        "ip_allowlist": r.get::<Vec<String>, _>("ip_allowlist"),
        "user_id": r.get::<Option<Uuid>, _>("user_id"),
        "org_id": r.get::<Option<Uuid>, _>("org_id"),
        "expires_at": r.get::<Option<DateTime<Utc>>, _>("expires_at"),
        "revoked_at": r.get::<Option<DateTime<Utc>>, _>("revoked_at"),
        "last_used_at": r.get::<Option<DateTime<Utc>>, _>("last_used_at"),
        "created_at": r.get::<DateTime<Utc>, _>("created_at"),
    })
}

const KEY_LIST_COLUMNS: &str = "id, prefix, scopes, ip_allowlist, user_id, org_id, expires_at, \
     revoked_at, last_used_at, created_at";

pub async fn list_keys(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows = sqlx::query(&format!(
        "SELECT {KEY_LIST_COLUMNS} FROM api_keys ORDER BY created_at DESC"
    ))
    .fetch_all(&state.db)
    .await?;
    Ok(Json(json!({ "keys": rows.iter().map(key_row_json).collect::<Vec<_>>() })))
}

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub scopes: Vec<String>,
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub org_id: Option<Uuid>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

async fn insert_key(state: &AppState, req: &CreateKeyRequest) -> Result<Json<Value>, ApiError> {
    for scope in &req.scopes {
        if Scope::parse(scope).is_none() {
            return Err(ApiError::InvalidRequest(format!("unknown scope '{scope}'")));
        }
    }
    if req.scopes.is_empty() {
        return Err(ApiError::InvalidRequest("at least one scope is required".into()));
    }
    for entry in &req.ip_allowlist {
        if entry.parse::<ipnet::IpNet>().is_err() && entry.parse::<std::net::IpAddr>().is_err() {
            return Err(ApiError::InvalidRequest(format!("malformed CIDR '{entry}'")));
        }
    }
    if let Some(expiry) = req.expires_at {
        if expiry <= Utc::now() {
            return Err(ApiError::InvalidRequest("expires_at is in the past".into()));
        }
    }

    let minted = keys::mint();
    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO api_keys (prefix, token_hash, scopes, ip_allowlist, user_id, org_id, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
    )
    .bind(&minted.prefix)
    .bind(&minted.token_hash)
    .bind(&req.scopes)
    .bind(&req.ip_allowlist)
    .bind(req.user_id)
    .bind(req.org_id)
    .bind(req.expires_at)
    .fetch_one(&state.db)
    .await?;

    tracing::info!(key_id = %id, prefix = %minted.prefix, "API key created");
    // The full token appears in this response and nowhere else.
    Ok(Json(json!({
        "id": id,
        "token": minted.token,
        "prefix": minted.prefix,
        "scopes": req.scopes,
        "expires_at": req.expires_at,
    })))
}

pub async fn create_key(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    insert_key(&state, &body).await
}

pub async fn revoke_key(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    // Revocation is permanent; re-revoking is a no-op, not an error.
    let result = sqlx::query(
        "UPDATE api_keys SET revoked_at = COALESCE(revoked_at, now()) WHERE id = $1",
    )
    .bind(id)
    .execute(&state.db)
    .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound("key not found".into()));
    }
    tracing::info!(key_id = %id, "API key revoked");
    Ok(Json(json!({ "revoked": true })))
}

// Self-service: a user manages their own keys.

fn session_user_id(principal: &Principal) -> Result<Uuid, ApiError> {
    principal
        .user_id()
        .ok_or_else(|| ApiError::Authentication("session has no user".into()))
}

pub async fn my_keys(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Value>, ApiError> {
    let user_id = session_user_id(&principal)?;
    let rows = sqlx::query(&format!(
        "SELECT {KEY_LIST_COLUMNS} FROM api_keys WHERE user_id = $1 ORDER BY created_at DESC"
    ))
    .bind(user_id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(json!({ "keys": rows.iter().map(key_row_json).collect::<Vec<_>>() })))
}

pub async fn create_my_key(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(mut body): Json<CreateKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = session_user_id(&principal)?;
    body.user_id = Some(user_id);
    body.org_id = sqlx::query_scalar::<_, Option<Uuid>>("SELECT org_id FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&state.db)
        .await?
        .flatten();
    insert_key(&state, &body).await
}

pub async fn revoke_my_key(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let user_id = session_user_id(&principal)?;
    let result = sqlx::query(
        "UPDATE api_keys SET revoked_at = COALESCE(revoked_at, now()) \
         WHERE id = $1 AND user_id = $2",
    )
    .bind(id)
    .bind(user_id)
    .execute(&state.db)
    .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound("key not found".into()));
    }
    Ok(Json(json!({ "revoked": true })))
}

// ── Models ──────────────────────────────────────────────────────────────

pub async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows = state.lifecycle.list().await?;
    Ok(Json(json!({ "models": rows })))
}

pub async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.lifecycle.fetch(id).await?)))
}

pub async fn create_model(
    State(state): State<AppState>,
    Json(body): Json<CreateModelRequest>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.lifecycle.create(body).await?)))
}

pub async fn update_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateModelRequest>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.lifecycle.update(id, body).await?)))
}

pub async fn delete_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    state.lifecycle.delete(id).await?;
    Ok(Json(json!({ "deleted": true })))
}

pub async fn start_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.lifecycle.start(id).await?)))
}

pub async fn stop_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.lifecycle.stop(id).await?)))
}

pub async fn test_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.lifecycle.test_model(id).await?))
}

pub async fn dry_run_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.lifecycle.dry_run(id).await?)))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

pub async fn model_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let logs = state.lifecycle.logs(id, q.tail.unwrap_or(200)).await?;
    Ok(Json(json!({ "logs": logs })))
}

// ── Runtime config overrides (config_kv) ────────────────────────────────

pub async fn get_config_value(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let value: Option<Value> = sqlx::query_scalar("SELECT value FROM config_kv WHERE key = $1")
        .bind(&key)
        .fetch_optional(&state.db)
        .await?;
    match value {
        Some(value) => Ok(Json(json!({ "key": key, "value": value }))),
        None => Err(ApiError::NotFound(format!("no config value for '{key}'"))),
    }
}

pub async fn put_config_value(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(value): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    sqlx::query(
        "INSERT INTO config_kv (key, value) VALUES ($1, $2) \
         ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = now()",
    )
    .bind(&key)
    .bind(&value)
    .execute(&state.db)
    .await?;
    Ok(Json(json!({ "key": key, "value": value })))
}
