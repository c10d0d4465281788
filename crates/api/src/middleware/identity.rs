//! Requester identity asserted by the fronting gateway.
//!
//! The gateway authenticates callers and forwards `x-user-id` (numeric)
//! and `x-user-role` headers. Requests without `x-user-id` are anonymous.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use genorch_core::error::CoreError;
use genorch_core::types::DbId;
use genorch_pipeline::service::Requester;

use crate::error::AppError;
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const ROLE_ADMIN: &str = "admin";

/// Caller identity, possibly anonymous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity(pub Requester);

impl FromRequestParts<AppState> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let user_id = header(USER_ID_HEADER)
            .map(|raw| {
                raw.parse::<DbId>().map_err(|_| {
                    AppError::BadRequest(format!("{USER_ID_HEADER} must be an integer"))
                })
            })
            .transpose()?;

        let is_admin = header(USER_ROLE_HEADER).is_some_and(|role| role == ROLE_ADMIN);

        Ok(Identity(Requester { user_id, is_admin }))
    }
}

/// Requires the `admin` role. Rejects with 403 Forbidden otherwise.
pub struct RequireAdmin(pub Requester);

impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Identity(requester) = Identity::from_request_parts(parts, state).await?;
        if !requester.is_admin {
            return Err(AppError::Core(CoreError::Forbidden(
                "Admin role required".into(),
            )));
        }
        Ok(RequireAdmin(requester))
    }
}
