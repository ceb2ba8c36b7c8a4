//! Caller identification at the HTTP and WebSocket boundary.
//!
//! Token issuance lives in another service. Here we only check that a token
//! is present (and matches the configured shared token, if there is one) and
//! read the caller's numeric user id.

use crate::config::AuthConfig;
use crate::error::{AppError, AppResult};
use actix_web::HttpRequest;
use serde::Deserialize;

pub const USER_ID_HEADER: &str = "X-User-ID";

/// Query string of the realtime upgrade request. Browsers cannot attach
/// custom headers to a WebSocket handshake, so credentials travel here.
#[derive(Debug, Default, Deserialize)]
pub struct CallQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Validate the upgrade query and return the caller's user id.
pub fn authenticate_query(query: &CallQuery, auth: &AuthConfig) -> AppResult<i64> {
    let token = query
        .token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthorized("missing token".to_string()))?;

    if !auth.access_token.is_empty() && token != auth.access_token {
        return Err(AppError::Unauthorized("invalid token".to_string()));
    }

    parse_user_id(query.user_id.as_deref())
}

/// Read the caller's user id from the `X-User-ID` header.
pub fn user_id_from_headers(req: &HttpRequest) -> AppResult<i64> {
    let value = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok());
    parse_user_id(value)
}

fn parse_user_id(raw: Option<&str>) -> AppResult<i64> {
    let raw = raw
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| AppError::Unauthorized("missing user_id".to_string()))?;
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(AppError::Unauthorized(format!("invalid user_id '{}'", raw))),
    }
}
