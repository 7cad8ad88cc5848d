//! Reading lifetime and issuer out of JWT access tokens.
//!
//! Signatures are not checked here. The server does that; the client only
//! needs to know when to refresh and where.

use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::auth::error::AuthError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub exp: Option<f64>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
}

pub fn decode_claims(token: &str) -> Result<TokenClaims, AuthError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data = jsonwebtoken::decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims)
}

pub fn issuer(token: &str) -> Result<String, AuthError> {
    decode_claims(token)?
        .iss
        .filter(|iss| !iss.is_empty())
        .ok_or(AuthError::MissingIssuer)
}

pub fn expires_at(token: &str) -> Option<OffsetDateTime> {
    let exp = decode_claims(token).ok()?.exp?;
    OffsetDateTime::from_unix_timestamp(exp.floor() as i64).ok()
}

/// Seconds until `token` expires, negative once it has. `None` when the
/// token carries no readable `exp`.
pub fn remaining_seconds(token: &str) -> Option<i64> {
    remaining_seconds_at(token, OffsetDateTime::now_utc())
}

pub fn remaining_seconds_at(token: &str, now: OffsetDateTime) -> Option<i64> {
    let expires = expires_at(token)?;
    Some((expires - now).whole_seconds())
}

/// Short human form of a duration in seconds, sign ignored: `1h 5m`,
/// `4m 30s`, `45s`.
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.unsigned_abs();
    let (hours, minutes, secs) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}


#[cfg(test)]
mod tests {
    use super::testing::token_with_lifetime;
    use super::*;

    #[test]
    fn reads_issuer_and_lifetime() {
        let token = token_with_lifetime("https://dex.example.com", 600);
        assert_eq!(issuer(&token).expect("issuer"), "https://dex.example.com");
        let remaining = remaining_seconds(&token).expect("remaining");
        assert!((590..=600).contains(&remaining), "remaining {remaining}");
    }

    #[test]
    fn expired_tokens_have_negative_lifetime() {
        let token = token_with_lifetime("https://dex.example.com", -30);
        assert!(remaining_seconds(&token).expect("remaining") < 0);
    }

    #[test]
    fn opaque_tokens_have_no_lifetime() {
        assert_eq!(remaining_seconds("not-a-jwt"), None);
        assert!(matches!(issuer("not-a-jwt"), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn token_without_exp_or_iss() {
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &serde_json::json!({ "sub": "tester" }),
            &jsonwebtoken::EncodingKey::from_secret(b"test"),
        )
        .expect("encode");
        assert_eq!(remaining_seconds(&token), None);
        assert!(matches!(issuer(&token), Err(AuthError::MissingIssuer)));
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(270), "4m 30s");
        assert_eq!(format_duration(3900), "1h 5m");
        assert_eq!(format_duration(-125), "2m 5s");
    }
}
