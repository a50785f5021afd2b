// API key issuance and verification.
//
// Token format: `ck-<8 char prefix><32 char secret>`. Only the SHA-256 of
// the full token is stored; the prefix is kept in clear for lookup and
// display. Verification is constant-time over the stored hash so a bad
// secret is indistinguishable from an unknown prefix.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub const TOKEN_TAG: &str = "ck-";
pub const PREFIX_LEN: usize = 8;
const SECRET_LEN: usize = 32;

/// Re-writing `last_used_at` on every request would serialize hot keys on
/// the row lock; one touch per minute is enough for display purposes.
const LAST_USED_WRITE_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Chat,
    Completions,
    Embeddings,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Chat => "chat",
            Scope::Completions => "completions",
            Scope::Embeddings => "embeddings",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "chat" => Some(Scope::Chat),
            "completions" => Some(Scope::Completions),
            "embeddings" => Some(Scope::Embeddings),
            _ => None,
        }
    }
}

/// A freshly minted key. `token` is shown to the caller exactly once.
pub struct MintedKey {
    pub token: String,
    pub prefix: String,
    pub token_hash: String,
}

pub fn mint() -> MintedKey {
    let body: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PREFIX_LEN + SECRET_LEN)
        .map(char::from)
        .collect();
    let token = format!("{TOKEN_TAG}{body}");
    MintedKey {
        prefix: body[..PREFIX_LEN].to_string(),
        token_hash: hash_token(&token),
        token,
    }
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Split a presented token into its lookup prefix. Returns None for
/// anything that cannot possibly be a key (wrong tag, too short).
pub fn token_prefix(token: &str) -> Option<&str> {
    let body = token.strip_prefix(TOKEN_TAG)?;
    if body.len() < PREFIX_LEN + SECRET_LEN {
        return None;
    }
    Some(&body[..PREFIX_LEN])
}

/// CIDR allowlist check. Entries may be networks (`10.0.0.0/8`) or bare
/// addresses (`192.168.1.7`). An empty list means unrestricted.
pub fn ip_allowed(allowlist: &[String], addr: IpAddr) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    allowlist.iter().any(|entry| {
        if let Ok(net) = entry.parse::<IpNet>() {
            net.contains(&addr)
        } else if let Ok(single) = entry.parse::<IpAddr>() {
            single == addr
        } else {
            tracing::warn!(entry = %entry, "ignoring malformed allowlist entry");
            false
        }
    })
}

#[derive(sqlx::FromRow)]
pub struct ApiKeyRow {
    pub id: Uuid,
    pub prefix: String,
    pub token_hash: String,
    pub scopes: Vec<String>,
    pub ip_allowlist: Vec<String>,
    pub user_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Authenticated API-key principal attached to the request.
#[derive(Debug, Clone)]
pub struct KeyPrincipal {
    pub key_id: Uuid,
    pub scopes: Vec<String>,
    pub user_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
}

impl KeyPrincipal {
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.iter().any(|s| s == scope.as_str())
    }
}

/// Verify a bearer token against the key store. The same generic 401 is
/// returned for unknown prefixes and wrong secrets.
pub async fn authenticate_key(
    state: &AppState,
    token: &str,
    client_ip: IpAddr,
) -> Result<KeyPrincipal, ApiError> {
    let invalid = || ApiError::Authentication("Invalid API key".to_string());

    let prefix = token_prefix(token).ok_or_else(invalid)?;
    let presented_hash = hash_token(token);

    // Prefixes are random but not unique by construction; compare every
    // candidate in constant time.
    let candidates: Vec<ApiKeyRow> = sqlx::query_as(
        "SELECT id, prefix, token_hash, scopes, ip_allowlist, user_id, org_id, \
                expires_at, revoked_at, last_used_at \
         FROM api_keys WHERE prefix = $1",
    )
    .bind(prefix)
    .fetch_all(&state.db)
    .await?;

    let row = candidates
        .into_iter()
        .find(|row| {
            row.token_hash
                .as_bytes()
                .ct_eq(presented_hash.as_bytes())
                .into()
        })
        .ok_or_else(invalid)?;

    if row.revoked_at.is_some() {
        return Err(ApiError::Authentication("API key has been revoked".to_string()));
    }
    if let Some(expiry) = row.expires_at {
        if Utc::now() >= expiry {
            return Err(ApiError::Authentication("API key has expired".to_string()));
        }
    }
    if !ip_allowed(&row.ip_allowlist, client_ip) {
        return Err(ApiError::Authentication(
            "Request address is not on this key's allowlist".to_string(),
        ));
    }

    touch_last_used(state, &row);

    Ok(KeyPrincipal {
        key_id: row.id,
        scopes: row.scopes,
        user_id: row.user_id,
        org_id: row.org_id,
    })
}

/// Lazily refresh `last_used_at` — fire-and-forget, at most once per
/// interval per key.
fn touch_last_used(state: &AppState, row: &ApiKeyRow) {
    let stale = match row.last_used_at {
        Some(ts) => (Utc::now() - ts).num_seconds() >= LAST_USED_WRITE_INTERVAL_SECS,
        None => true,
    };
    if !stale {
        return;
    }
    let db = state.db.clone();
    let id = row.id;
    tokio::spawn(async move {
        let _ = sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
            .bind(id)
            .execute(&db)
            .await;
    });
}
