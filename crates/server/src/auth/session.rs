// Session-token verification for WebSocket upgrades.
//
// The host CMS issues an HS256 JWT in an HTTP-only cookie; this server
// shares the signing secret and derives an `Accountability` from the
// verified claims. Tokens are never issued to browsers from here —
// `issue_session_token` exists for the host-side contract and tests.

use anyhow::{anyhow, bail, Context};
use fieldsync_common::types::Accountability;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const SESSION_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    role: String,
    #[serde(default)]
    admin: bool,
    iat: i64,
    exp: i64,
}

#[derive(Clone)]
pub struct SessionTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl SessionTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("session secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_session_token(&self, accountability: &Accountability) -> anyhow::Result<String> {
        self.issue_session_token_at(accountability, current_unix_timestamp()?)
    }

    fn issue_session_token_at(
        &self,
        accountability: &Accountability,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = SessionClaims {
            sub: accountability.user_id.to_string(),
            role: accountability.role.clone(),
            admin: accountability.admin,
            iat: issued_at,
            exp: issued_at + SESSION_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode session token")
    }

    pub fn verify_session_token(&self, token: &str) -> anyhow::Result<Accountability> {
        let claims = decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode session token")?
            .claims;

        let user_id = Uuid::parse_str(&claims.sub)
            .with_context(|| format!("session token subject '{}' is not a UUID", claims.sub))?;

        Ok(Accountability { user_id, role: claims.role, admin: claims.admin })
    }
}

/// Extract the session token from the `Cookie` request headers.
///
/// Returns `None` when no cookie with the configured name is present.
pub fn session_cookie_token(headers: &axum::http::HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| cookie::Cookie::split_parse(raw.to_owned()))
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == cookie_name)
        .map(|cookie| cookie.value().to_string())
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{
        current_unix_timestamp, session_cookie_token, SessionTokenService,
        SESSION_TOKEN_TTL_SECONDS,
    };
    use axum::http::{header::COOKIE, HeaderMap, HeaderValue};
    use fieldsync_common::types::Accountability;
    use uuid::Uuid;

    const TEST_SECRET: &str = "fieldsync_test_secret_that_is_definitely_long_enough";

    fn editor() -> Accountability {
        Accountability { user_id: Uuid::new_v4(), role: "editor".to_string(), admin: false }
    }

    #[test]
    fn issues_and_verifies_session_tokens() {
        let service = SessionTokenService::new(TEST_SECRET).expect("service should initialize");
        let accountability = editor();

        let token =
            service.issue_session_token(&accountability).expect("token should be issued");
        let verified = service.verify_session_token(&token).expect("token should verify");

        assert_eq!(verified, accountability);
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(SessionTokenService::new("too-short").is_err());
    }

    #[test]
    fn rejects_tampered_tokens() {
        let service = SessionTokenService::new(TEST_SECRET).expect("service should initialize");
        let token = service.issue_session_token(&editor()).expect("token should be issued");
        let tampered = format!("{token}x");

        assert!(service.verify_session_token(&tampered).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let service = SessionTokenService::new(TEST_SECRET).expect("service should initialize");
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - SESSION_TOKEN_TTL_SECONDS
            - 1;
        let token = service
            .issue_session_token_at(&editor(), issued_at)
            .expect("token should be issued");

        assert!(service.verify_session_token(&token).is_err());
    }

    #[test]
    fn cookie_extraction_finds_the_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; fieldsync_session=abc123; lang=en"),
        );

        let token = session_cookie_token(&headers, "fieldsync_session");
        assert_eq!(token.as_deref(), Some("abc123"));
    }

    #[test]
    fn cookie_extraction_returns_none_when_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark"));

        assert!(session_cookie_token(&headers, "fieldsync_session").is_none());
    }

    #[test]
    fn cookie_extraction_handles_missing_header() {
        let headers = HeaderMap::new();
        assert!(session_cookie_token(&headers, "fieldsync_session").is_none());
    }
}
