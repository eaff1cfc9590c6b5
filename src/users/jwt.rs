use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{config::JwtConfig, error::ApiError, state::AppState};

use super::claims::{Claims, TokenKind};

/// Why a token failed verification.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        ApiError::Unauthorized(e.to_string())
    }
}

/// Signing and verification keys for both token kinds. Access and refresh
/// tokens use distinct secrets, so a leaked access secret cannot mint a
/// refresh token and vice versa.
#[derive(Clone)]
pub struct JwtKeys {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    issuer: String,
    audience: String,
    pub access_ttl: TimeDuration,
    pub refresh_ttl: TimeDuration,
}

impl JwtKeys {
    pub fn new(cfg: &JwtConfig) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(cfg.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(cfg.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(cfg.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(cfg.refresh_secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            access_ttl: TimeDuration::minutes(cfg.access_ttl_minutes),
            refresh_ttl: TimeDuration::days(cfg.refresh_ttl_days),
        }
    }

    fn sign_with_kind(&self, user_id: Uuid, kind: TokenKind) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let (key, ttl) = match kind {
            TokenKind::Access => (&self.access_encoding, self.access_ttl),
            TokenKind::Refresh => (&self.refresh_encoding, self.refresh_ttl),
        };
        let exp = now + ttl;
        let claims = Claims {
            sub: user_id,
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: Uuid::new_v4(),
            kind,
        };
        let token = encode(&Header::default(), &claims, key)?;
        debug!(user_id = %user_id, kind = ?kind, "jwt signed");
        Ok(token)
    }

    pub fn sign_access(&self, user_id: Uuid) -> anyhow::Result<String> {
        self.sign_with_kind(user_id, TokenKind::Access)
    }
    pub fn sign_refresh(&self, user_id: Uuid) -> anyhow::Result<String> {
        self.sign_with_kind(user_id, TokenKind::Refresh)
    }

    /// Verify signature, expiry, issuer, audience and kind for a token of
    /// the given class.
    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let decoding = match kind {
            TokenKind::Access => &self.access_decoding,
            TokenKind::Refresh => &self.refresh_decoding,
        };
        let mut validation = Validation::default();
        validation.leeway = 0;
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, decoding, &validation).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Invalid(e.to_string()),
        })?;
        if data.claims.kind != kind {
            return Err(TokenError::Invalid("wrong token kind".into()));
        }
        debug!(user_id = %data.claims.sub, kind = ?kind, "jwt verified");
        Ok(data.claims)
    }
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        Self::new(&state.config.jwt)
    }
}

/// Extracts and validates the access token, returning the user ID.
/// Accepts the `accessToken` cookie or an `Authorization: Bearer` header.
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = JwtKeys::from_ref(state);

        let cookie_token = tower_cookies::Cookies::from_request_parts(parts, state)
            .await
            .ok()
            .and_then(|cookies| cookies.get("accessToken").map(|c| c.value().to_string()));

        let bearer_token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.to_string());

        let token = cookie_token
            .or(bearer_token)
            .ok_or_else(|| ApiError::Unauthorized("missing access token".into()))?;

        let claims = match keys.verify(&token, TokenKind::Access) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "access token rejected");
                return Err(ApiError::Unauthorized("invalid or expired token".into()));
            }
        };

        Ok(AuthUser(claims.sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> JwtConfig {
        JwtConfig {
            access_secret: "test-access-secret".into(),
            refresh_secret: "test-refresh-secret".into(),
            issuer: "test-issuer".into(),
            audience: "test-aud".into(),
            access_ttl_minutes: 5,
            refresh_ttl_days: 1,
        }
    }

    #[test]
    fn sign_and_verify_access_token() {
        let keys = JwtKeys::new(&test_config());
        let user_id = Uuid::new_v4();
        let token = keys.sign_access(user_id).expect("sign access");
        let claims = keys.verify(&token, TokenKind::Access).expect("verify");
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.iss, "test-issuer");
        assert_eq!(claims.aud, "test-aud");
        assert_eq!(claims.kind, TokenKind::Access);
    }

    #[test]
    fn sign_and_verify_refresh_token() {
        let keys = JwtKeys::new(&test_config());
        let user_id = Uuid::new_v4();
        let token = keys.sign_refresh(user_id).expect("sign refresh");
        let claims = keys.verify(&token, TokenKind::Refresh).expect("verify");
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.kind, TokenKind::Refresh);
    }

    #[test]
    fn access_token_is_not_a_refresh_token() {
        // Distinct secrets: the refresh key cannot even validate the
        // signature of an access token.
        let keys = JwtKeys::new(&test_config());
        let token = keys.sign_access(Uuid::new_v4()).expect("sign access");
        let err = keys.verify(&token, TokenKind::Refresh).unwrap_err();
        assert!(matches!(err, TokenError::Invalid(_)));
    }

    #[test]
    fn kind_claim_is_checked_even_with_shared_secret() {
        let mut cfg = test_config();
        cfg.refresh_secret = cfg.access_secret.clone();
        let keys = JwtKeys::new(&cfg);
        let token = keys.sign_access(Uuid::new_v4()).expect("sign access");
        let err = keys.verify(&token, TokenKind::Refresh).unwrap_err();
        assert!(matches!(err, TokenError::Invalid(_)));
    }

    #[test]
    fn expired_token_is_rejected_as_expired() {
        let mut cfg = test_config();
        cfg.access_ttl_minutes = -5;
        let keys = JwtKeys::new(&cfg);
        let token = keys.sign_access(Uuid::new_v4()).expect("sign access");
        let err = keys.verify(&token, TokenKind::Access).unwrap_err();
        assert!(matches!(err, TokenError::Expired));
    }

    #[test]
    fn verify_rejects_wrong_issuer_or_audience() {
        let keys = JwtKeys::new(&test_config());
        let mut other_cfg = test_config();
        other_cfg.issuer = "someone-else".into();
        other_cfg.audience = "other-aud".into();
        let other = JwtKeys::new(&other_cfg);
        let token = keys.sign_access(Uuid::new_v4()).expect("sign access");
        assert!(other.verify(&token, TokenKind::Access).is_err());
    }

    #[test]
    fn two_mints_for_same_user_differ() {
        let keys = JwtKeys::new(&test_config());
        let user_id = Uuid::new_v4();
        let t1 = keys.sign_refresh(user_id).expect("sign");
        let t2 = keys.sign_refresh(user_id).expect("sign");
        assert_ne!(t1, t2);
    }

    fn parts_with_auth(token: Option<&str>) -> Parts {
        let mut builder = axum::http::Request::builder().uri("/");
        if let Some(token) = token {
            builder = builder.header(
                axum::http::header::AUTHORIZATION,
                format!("Bearer {token}"),
            );
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[tokio::test]
    async fn auth_user_accepts_a_bearer_access_token() {
        let state = AppState::fake();
        let keys = JwtKeys::from_ref(&state);
        let user_id = Uuid::new_v4();
        let token = keys.sign_access(user_id).expect("sign access");

        let mut parts = parts_with_auth(Some(&token));
        let AuthUser(extracted) = AuthUser::from_request_parts(&mut parts, &state)
            .await
            .expect("extract user");
        assert_eq!(extracted, user_id);
    }

    #[tokio::test]
    async fn auth_user_rejects_a_refresh_token_in_the_header() {
        let state = AppState::fake();
        let keys = JwtKeys::from_ref(&state);
        let token = keys.sign_refresh(Uuid::new_v4()).expect("sign refresh");

        let mut parts = parts_with_auth(Some(&token));
        assert!(AuthUser::from_request_parts(&mut parts, &state)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn auth_user_rejects_requests_without_a_token() {
        let state = AppState::fake();
        let mut parts = parts_with_auth(None);
        assert!(AuthUser::from_request_parts(&mut parts, &state)
            .await
            .is_err());
    }
}
