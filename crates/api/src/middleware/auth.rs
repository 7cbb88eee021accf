//! Access gate extractor for Axum handlers.

use axum::extract::{FromRequestParts, Query};
use axum::http::header::{AUTHORIZATION, UPGRADE};
use axum::http::request::Parts;
use forge_core::error::CoreError;
use serde::Deserialize;

use crate::auth::jwt::validate_token;
use crate::error::AppError;
use crate::state::AppState;

/// Authenticated caller resolved from a JWT.
///
/// The token comes from the `Authorization: Bearer <token>` header. Browsers
/// cannot set headers on WebSocket upgrades, so upgrade requests may pass it
/// as a `token` query parameter instead.
///
/// ```ignore
/// async fn my_handler(caller: Caller) -> AppResult<Json<()>> {
///     tracing::info!(caller = %caller.id, "handling request");
///     Ok(Json(()))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Caller {
    /// Stable caller identifier (from `claims.sub`).
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct TokenParam {
    token: Option<String>,
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = match parts.headers.get(AUTHORIZATION) {
            Some(value) => {
                let header = value.to_str().map_err(|_| {
                    AppError::Core(CoreError::Unauthorized(
                        "Invalid Authorization header".into(),
                    ))
                })?;
                header
                    .strip_prefix("Bearer ")
                    .ok_or_else(|| {
                        AppError::Core(CoreError::Unauthorized(
                            "Invalid Authorization format. Expected: Bearer <token>".into(),
                        ))
                    })?
                    .to_string()
            }
            None if is_websocket_upgrade(parts) => Query::<TokenParam>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(param)| param.token)
                .ok_or_else(|| {
                    AppError::Core(CoreError::Unauthorized("Missing access token".into()))
                })?,
            None => {
                return Err(AppError::Core(CoreError::Unauthorized(
                    "Missing Authorization header".into(),
                )));
            }
        };

        let claims = validate_token(&token, &state.config.jwt).map_err(|_| {
            AppError::Core(CoreError::Unauthorized("Invalid or expired token".into()))
        })?;
        if claims.sub.trim().is_empty() {
            return Err(AppError::Core(CoreError::Unauthorized(
                "Token has no subject".into(),
            )));
        }

        tracing::info!(
            caller = %claims.sub,
            method = %parts.method,
            path = parts.uri.path(),
            "Caller authenticated",
        );

        Ok(Caller { id: claims.sub })
    }
}

fn is_websocket_upgrade(parts: &Parts) -> bool {
    parts
        .headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}
