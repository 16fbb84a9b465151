//! API key authentication
//!
//! Clients authenticate with `X-API-Key: <key>` or `Authorization: Bearer <key>`.
//! Keys are looked up by their SHA-256 digest in the clients table.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};

use crate::db::ClientRepository;
use crate::error::AppError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// The client a request was authenticated as
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub client_id: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedClient {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let api_key = api_key_from_headers(&parts.headers)
            .ok_or_else(|| AppError::Unauthorized("missing API key".to_string()))?;

        let client_id = ClientRepository::new(state.db())
            .find_by_api_key(api_key)
            .await?
            .ok_or_else(|| {
                tracing::warn!("Rejected request with unknown API key");
                AppError::Unauthorized("invalid API key".to_string())
            })?;

        Ok(Self { client_id })
    }
}

fn api_key_from_headers(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key.trim()).filter(|k| !k.is_empty());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            // The scheme name is case-insensitive.
            v.get(..7)
                .filter(|scheme| scheme.eq_ignore_ascii_case("bearer "))
                .map(|_| v[7..].trim())
        })
        .filter(|k| !k.is_empty())
}
