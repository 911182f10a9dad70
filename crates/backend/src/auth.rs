//! Bearer-token authentication for the owner-facing API.
//!
//! Owners authenticate with a JWT whose subject is their owner id. The
//! middleware validates the token and stashes the owner in request
//! extensions; handlers read it back with `Extension<AuthOwner>`.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorResponse;
use crate::AppState;

const TOKEN_DURATION_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Owner id
    pub sub: Uuid,
    pub iat: i64,
    pub exp: i64,
}

/// The authenticated owner, inserted into request extensions by `require_auth`.
#[derive(Debug, Clone, Copy)]
pub struct AuthOwner(pub Uuid);

/// Mint an owner JWT. No endpoint issues tokens: owners are provisioned
/// out-of-band and handed a token signed with the shared `JWT_SECRET`. This
/// is the reference for that signing format, and what the tests mint with.
#[allow(dead_code)]
pub fn create_token(secret: &str, owner_id: Uuid) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        sub: owner_id,
        iat: now.timestamp(),
        exp: (now + Duration::days(TOKEN_DURATION_DAYS)).timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn validate_token(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;

    Ok(token_data.claims)
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
            details: None,
        }),
    )
        .into_response()
}

/// Middleware for owner-facing routes, used with
/// `axum::middleware::from_fn_with_state`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer(request.headers()) else {
        return unauthorized("Missing authentication");
    };

    let claims = match validate_token(&state.config.jwt_secret, token) {
        Ok(c) => c,
        Err(_) => return unauthorized("Invalid or expired token"),
    };

    request.extensions_mut().insert(AuthOwner(claims.sub));
    next.run(request).await
}

/// Shared-secret check for the internal job-processing endpoint.
pub fn internal_token_matches(headers: &HeaderMap, expected: &str) -> bool {
    extract_bearer(headers) == Some(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-for-testing-only";

    #[test]
    fn token_round_trips() {
        let owner = Uuid::new_v4();
        let token = create_token(SECRET, owner).expect("should create token");

        let claims = validate_token(SECRET, &token).expect("should validate token");
        assert_eq!(claims.sub, owner);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn invalid_token_rejected() {
        assert!(validate_token(SECRET, "not-a-token").is_err());
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = create_token(SECRET, Uuid::new_v4()).expect("should create token");
        assert!(validate_token("other-secret", &token).is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let now = Utc::now();
        let claims = Claims {
            sub: Uuid::new_v4(),
            iat: (now - Duration::days(8)).timestamp(),
            exp: (now - Duration::days(1)).timestamp(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        assert!(validate_token(SECRET, &token).is_err());
    }

    #[test]
    fn internal_token_compares_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer hunter2".parse().unwrap());
        assert!(internal_token_matches(&headers, "hunter2"));
        assert!(!internal_token_matches(&headers, "other"));
        assert!(!internal_token_matches(&HeaderMap::new(), "hunter2"));
    }
}
