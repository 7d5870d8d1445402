//! Bearer-token verification.
//!
//! Token minting lives in the account service; this side only verifies
//! HS256 signatures and expiry. The SSE route also accepts `?token=`
//! because EventSource clients cannot set request headers.

use anyhow::{Result, anyhow};
use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub email: Option<String>,
    pub exp: u64,
}

pub fn verify_token(secret: &str, token: &str) -> Result<Claims> {
    if secret.is_empty() {
        return Err(anyhow!("JWT_SECRET is not configured"));
    }

    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| anyhow!("invalid token: {}", e))?;

    Ok(data.claims)
}

/// Pull a bearer token from the Authorization header, falling back to an
/// explicit query-string token.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    query_token
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn mint(secret: &str, exp: u64) -> String {
        let claims = Claims {
            sub: "user-1".to_string(),
            email: Some("dev@example.com".to_string()),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> u64 {
        4_102_444_800 // 2100-01-01
    }

    #[test]
    fn test_valid_token_round_trips() {
        let token = mint("topsecret", far_future());
        let claims = verify_token("topsecret", &token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email.as_deref(), Some("dev@example.com"));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = mint("topsecret", far_future());
        assert!(verify_token("other", &token).is_err());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let token = mint("topsecret", 1_000_000);
        assert!(verify_token("topsecret", &token).is_err());
    }

    #[test]
    fn test_extract_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer from-header".parse().unwrap(),
        );
        assert_eq!(
            extract_token(&headers, Some("from-query")).as_deref(),
            Some("from-header")
        );
        assert_eq!(
            extract_token(&HeaderMap::new(), Some("from-query")).as_deref(),
            Some("from-query")
        );
        assert!(extract_token(&HeaderMap::new(), None).is_none());
    }
}
