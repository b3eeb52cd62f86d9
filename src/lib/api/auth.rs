use axum::{extract::FromRequestParts, http::request::Parts};

use super::types::{ACCESS_TOKEN_HEADER, ApiError, AppState};
use crate::lib::fleet::types::User;

/// The authenticated caller. Extracting it rejects the request with
/// `missing_token` or `invalid_token` before the handler runs.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(ACCESS_TOKEN_HEADER)
            .ok_or_else(ApiError::missing_token)?;

        let token = header.to_str().map_err(|_| ApiError::invalid_token())?.trim();
        if token.is_empty() {
            return Err(ApiError::missing_token());
        }

        match state.accounts.find_user_by_token(token) {
            Some(user) => Ok(AuthUser(user)),
            None => {
                tracing::debug!("Rejected unknown access token");
                Err(ApiError::invalid_token())
            }
        }
    }
}
