//! Request authentication.
//!
//! Credential precedence for the generation API, in order: `X-Api-Key`
//! header, `api_key` query parameter, session cookie.  The first credential
//! found is the one checked; the scheduler itself never re-derives identity.
//! With no API keys configured the check is disabled (local development).
//!
//! The admin and worker-callback surfaces use a separate bearer token.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ServerError;
use crate::state::AppState;

const API_KEY_HEADER: &str = "x-api-key";
const API_KEY_PARAM: &str = "api_key";
const SESSION_COOKIE: &str = "kiln_session";

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let keys = &state.config.api_keys;
    if keys.is_empty() {
        return next.run(req).await;
    }

    let provided = header_key(&req)
        .or_else(|| query_key(&req))
        .or_else(|| cookie_key(&req));

    match provided {
        Some(key) if keys.iter().any(|k| k == &key) => next.run(req).await,
        _ => ServerError::Unauthorized.into_response(),
    }
}

/// Bearer-token guard for `/admin` and `/internal`.  Open when no token is
/// configured.
pub async fn require_admin_token(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(expected) = &state.config.admin_token {
        let provided = req
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match provided {
            Some(token) if token == expected => {}
            _ => return ServerError::Unauthorized.into_response(),
        }
    }
    next.run(req).await
}

fn header_key(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn query_key(req: &Request<Body>) -> Option<String> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == API_KEY_PARAM).then(|| value.to_owned())
    })
}

fn cookie_key(req: &Request<Body>) -> Option<String> {
    let cookies = req
        .headers()
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())?;
    cookies.split(';').find_map(|cookie| {
        let (name, value) = cookie.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_owned())
    })
}
