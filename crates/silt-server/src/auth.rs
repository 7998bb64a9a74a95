use std::sync::Arc;

use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub session_id: Option<String>,
}

/// HS256 bearer-token verifier backed by a shared deployment secret
#[derive(Clone)]
pub struct AccessTokenVerifier {
    key: DecodingKey,
    config: Arc<AppConfig>,
}

impl AccessTokenVerifier {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            key: DecodingKey::from_secret(config.auth_secret.as_bytes()),
            config,
        }
    }

    pub fn verify_access_token(&self, token: &str) -> Result<AuthenticatedUser, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.auth_issuer.as_str()]);
        validation.validate_aud = false;
        validation.leeway = self.config.auth_clock_skew.as_secs();

        let decoded = decode::<AccessClaims>(token, &self.key, &validation).map_err(|error| {
            AppError::unauthorized(format!("Token validation failed: {}", sanitize(&error)))
        })?;

        if decoded.claims.sub.trim().is_empty() {
            return Err(AppError::unauthorized("Token subject is missing"));
        }
        validate_issued_at(&decoded.claims, self.config.auth_clock_skew)?;

        Ok(AuthenticatedUser {
            user_id: decoded.claims.sub,
            session_id: decoded.claims.session_id.or(decoded.claims.jti),
        })
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    sub: String,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    jti: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

// jsonwebtoken checks exp/nbf but not iat; a token minted in the future is
// a clock or forgery problem either way.
fn validate_issued_at(claims: &AccessClaims, clock_skew: std::time::Duration) -> Result<(), AppError> {
    let now = chrono::Utc::now().timestamp();
    let skew = i64::try_from(clock_skew.as_secs()).unwrap_or(0);

    let iat = claims
        .iat
        .ok_or_else(|| AppError::unauthorized("Token missing `iat` claim"))?;
    if iat > now.saturating_add(skew) {
        return Err(AppError::unauthorized("Token `iat` is in the future"));
    }

    Ok(())
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        iss: String,
        exp: i64,
        iat: i64,
    }

    fn test_config() -> Arc<AppConfig> {
        Arc::new(AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            database_path: ":memory:".to_string(),
            auth_secret: "a-long-enough-secret-value".to_string(),
            auth_issuer: "silt".to_string(),
            auth_clock_skew: std::time::Duration::from_secs(60),
            rate_limit_window: std::time::Duration::from_secs(60),
            sync_push_rate_limit_per_window: 60,
            resolve_rate_limit_per_window: 30,
            max_pull_limit: 500,
        })
    }

    fn mint(config: &AppConfig, sub: &str, iss: &str, exp_offset: i64, iat_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = TestClaims {
            sub: sub.to_string(),
            iss: iss.to_string(),
            exp: now + exp_offset,
            iat: now + iat_offset,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.auth_secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn bearer_token_extractor_accepts_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );

        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn bearer_token_extractor_rejects_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_err());
    }

    #[test]
    fn verifier_accepts_valid_token() {
        let config = test_config();
        let verifier = AccessTokenVerifier::new(config.clone());
        let token = mint(&config, "user-a", "silt", 300, -10);

        let user = verifier.verify_access_token(&token).unwrap();
        assert_eq!(user.user_id, "user-a");
    }

    #[test]
    fn verifier_rejects_expired_token() {
        let config = test_config();
        let verifier = AccessTokenVerifier::new(config.clone());
        let token = mint(&config, "user-a", "silt", -300, -600);

        assert!(verifier.verify_access_token(&token).is_err());
    }

    #[test]
    fn verifier_rejects_wrong_issuer() {
        let config = test_config();
        let verifier = AccessTokenVerifier::new(config.clone());
        let token = mint(&config, "user-a", "someone-else", 300, -10);

        assert!(verifier.verify_access_token(&token).is_err());
    }

    #[test]
    fn verifier_rejects_future_iat() {
        let config = test_config();
        let verifier = AccessTokenVerifier::new(config.clone());
        let token = mint(&config, "user-a", "silt", 300, 120);

        let err = verifier.verify_access_token(&token).unwrap_err();
        assert!(err.to_string().contains("future"));
    }

    #[test]
    fn verifier_rejects_tampered_signature() {
        let config = test_config();
        let verifier = AccessTokenVerifier::new(config.clone());
        let other = AppConfig {
            auth_secret: "a-different-secret-value!".to_string(),
            ..(*test_config()).clone()
        };
        let token = mint(&other, "user-a", "silt", 300, -10);

        assert!(verifier.verify_access_token(&token).is_err());
    }
}
