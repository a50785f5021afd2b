// Authentication middleware for the two principals the gateway knows:
// API keys on the /v1 surface, session-authenticated users on /admin.

pub mod keys;
pub mod sessions;

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::state::AppState;
use keys::{KeyPrincipal, Scope};

/// Session-authenticated user (admin surface).
#[derive(Debug, Clone)]
pub struct SessionPrincipal {
    pub user_id: uuid::Uuid,
    pub username: String,
    pub is_admin: bool,
}

/// Whoever a request acts as after authentication.
#[derive(Debug, Clone)]
pub enum Principal {
    Key(KeyPrincipal),
    Session(SessionPrincipal),
    /// DEV_AUTH_BYPASS only.
    DevBypass,
}

impl Principal {
    pub fn key_id(&self) -> Option<uuid::Uuid> {
        match self {
            Principal::Key(k) => Some(k.key_id),
            _ => None,
        }
    }

    pub fn user_id(&self) -> Option<uuid::Uuid> {
        match self {
            Principal::Key(k) => k.user_id,
            Principal::Session(s) => Some(s.user_id),
            Principal::DevBypass => None,
        }
    }

    pub fn org_id(&self) -> Option<uuid::Uuid> {
        match self {
            Principal::Key(k) => k.org_id,
            _ => None,
        }
    }

    /// Rate-limit subject: key id when present, else marker handled by the
    /// caller (which falls back to the client IP).
    pub fn limiter_subject(&self) -> Option<String> {
        self.key_id().map(|id| format!("key:{id}"))
    }
}

/// Scope demanded by each OpenAI-surface path. `/v1/models` accepts any
/// authenticated caller.
pub fn required_scope(path: &str) -> Option<Scope> {
    match path {
        "/v1/chat/completions" => Some(Scope::Chat),
        "/v1/completions" => Some(Scope::Completions),
        "/v1/embeddings" => Some(Scope::Embeddings),
        _ => None,
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

/// Effective client address: walk back `trusted_proxy_hops` entries from
/// the right of `x-forwarded-for`, falling back to the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trusted_hops: usize) -> IpAddr {
    let fallback = peer.unwrap_or(IpAddr::from([127, 0, 0, 1]));
    if trusted_hops == 0 {
        return fallback;
    }
    let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) else {
        return fallback;
    };
    let hops: Vec<IpAddr> = forwarded
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();
    if hops.len() < trusted_hops {
        return fallback;
    }
    hops[hops.len() - trusted_hops]
}

fn peer_addr(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Middleware for the OpenAI surface: bearer key → scope check → rate
/// limit, in that order. The resolved `Principal` and effective client IP
/// are attached as request extensions for the handlers.
pub async fn api_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();
    let ip = client_ip(
        request.headers(),
        peer_addr(&request),
        state.config.trusted_proxy_hops,
    );

    let principal = if state.config.dev_auth_bypass {
        Principal::DevBypass
    } else {
        let Some(token) = bearer_token(request.headers()) else {
            // A session also grants the read-only model listing.
            if let Some(scope) = required_scope(&path) {
                state.metrics.auth_blocked.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Err(ApiError::Authentication(format!(
                    "Missing API key for {} access",
                    scope.as_str()
                )));
            }
            state.metrics.auth_blocked.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(ApiError::Authentication("Missing credentials".to_string()));
        };

        match keys::authenticate_key(&state, token, ip).await {
            Ok(key) => Principal::Key(key),
            Err(key_err) => {
                // Session tokens may browse /v1/models; inference scopes
                // stay key-only.
                if required_scope(&path).is_none() {
                    match sessions::authenticate_session(&state, token).await {
                        Ok(session) => Principal::Session(session),
                        Err(_) => {
                            state.metrics.auth_blocked.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            return Err(key_err);
                        }
                    }
                } else {
                    state.metrics.auth_blocked.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Err(key_err);
                }
            }
        }
    };

    if let Some(scope) = required_scope(&path) {
        if let Principal::Key(ref key) = principal {
            if !key.has_scope(scope) {
                state.metrics.auth_blocked.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Err(ApiError::Permission(format!(
                    "This key does not carry the '{}' scope",
                    scope.as_str()
                )));
            }
        }
    }

    state.metrics.auth_allowed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    // Rate limit after identity so the bucket is per-key, not per-IP, for
    // authenticated callers.
    let subject = principal
        .limiter_subject()
        .unwrap_or_else(|| format!("ip:{ip}"));
    let decision = state.limiter.admit(&subject, 1).await;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after_ms: decision.retry_after_ms,
        });
    }

    request.extensions_mut().insert(principal);
    request.extensions_mut().insert(ClientIp(ip));
    Ok(next.run(request).await)
}

/// Effective client address, as an extension for handlers.
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub IpAddr);

/// Middleware for /admin: requires an admin session (or dev bypass).
pub async fn admin_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.config.dev_auth_bypass {
        request.extensions_mut().insert(Principal::DevBypass);
        return Ok(next.run(request).await);
    }

    let token = bearer_token(request.headers())
        .ok_or_else(|| ApiError::Authentication("Missing session token".to_string()))?;
    let session = sessions::authenticate_session(&state, token).await?;
    if !session.is_admin {
        return Err(ApiError::Permission("Admin role required".to_string()));
    }

    request.extensions_mut().insert(Principal::Session(session));
    Ok(next.run(request).await)
}

/// Middleware for self-service routes (/admin/keys/me): any valid session.
pub async fn user_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.config.dev_auth_bypass {
        request.extensions_mut().insert(Principal::DevBypass);
        return Ok(next.run(request).await);
    }

    let token = bearer_token(request.headers())
        .ok_or_else(|| ApiError::Authentication("Missing session token".to_string()))?;
    let session = sessions::authenticate_session(&state, token).await?;
    request.extensions_mut().insert(Principal::Session(session));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn scope_map_covers_inference_paths() {
        assert_eq!(required_scope("/v1/chat/completions"), Some(Scope::Chat));
        assert_eq!(required_scope("/v1/completions"), Some(Scope::Completions));
        assert_eq!(required_scope("/v1/embeddings"), Some(Scope::Embeddings));
        assert_eq!(required_scope("/v1/models"), None);
        assert_eq!(required_scope("/v1/models/status"), None);
    }

    #[test]
    fn client_ip_ignores_forwarded_without_trust() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        let peer: IpAddr = "9.9.9.9".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer), 0), peer);
    }

    #[test]
    fn client_ip_walks_trusted_hops() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.2"),
        );
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        // One trusted hop: the rightmost entry is the proxy's view of the client.
        assert_eq!(
            client_ip(&headers, Some(peer), 1),
            "10.0.0.2".parse::<IpAddr>().unwrap()
        );
        // Two trusted hops: step past the proxy to the origin.
        assert_eq!(
            client_ip(&headers, Some(peer), 2),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}
