use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::auth::error::AuthError;

pub const DEFAULT_CLIENT_ID: &str = "jumpstarter-cli";

/// The parts of an issuer's discovery document we use.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: Option<String>,
    pub token_endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Absent when the provider does not rotate refresh tokens.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// Exchanges a refresh token at an identity provider.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, issuer: &str, refresh_token: &str) -> Result<TokenResponse, AuthError>;
}

#[derive(Debug, Clone)]
pub struct OidcClient {
    client: Client,
    client_id: String,
}

impl OidcClient {
    pub fn new() -> Result<Self, AuthError> {
        Self::with_client_id(DEFAULT_CLIENT_ID)
    }

    pub fn with_client_id(client_id: impl Into<String>) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| AuthError::Config(err.to_string()))?;
        Ok(Self {
            client,
            client_id: client_id.into(),
        })
    }

    pub fn discovery_url(issuer: &str) -> Result<Url, AuthError> {
        let mut base = Url::parse(issuer)
            .map_err(|err| AuthError::Config(format!("invalid issuer '{issuer}': {err}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(".well-known/openid-configuration")
            .map_err(|err| AuthError::Config(format!("invalid issuer '{issuer}': {err}")))
    }

    pub async fn discover(&self, issuer: &str) -> Result<ProviderMetadata, AuthError> {
        let url = Self::discovery_url(issuer)?;
        let response = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()
            .map_err(AuthError::from)?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl TokenRefresher for OidcClient {
    async fn refresh(&self, issuer: &str, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let metadata = self.discover(issuer).await?;
        let response = self
            .client
            .post(&metadata.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response.json().await?);
        }

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or(ErrorBody {
            error: None,
            error_description: Some(text.clone()),
        });
        Err(AuthError::Provider(format!(
            "token refresh failed ({status}): {}",
            body.error_description
                .filter(|detail| !detail.is_empty())
                .or(body.error)
                .unwrap_or_else(|| "unknown error".into())
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_url_keeps_issuer_path() {
        assert_eq!(
            OidcClient::discovery_url("https://dex.example.com").expect("url").as_str(),
            "https://dex.example.com/.well-known/openid-configuration"
        );
        assert_eq!(
            OidcClient::discovery_url("https://idp.example.com/realms/lab").expect("url").as_str(),
            "https://idp.example.com/realms/lab/.well-known/openid-configuration"
        );
        assert!(OidcClient::discovery_url("not a url").is_err());
    }

    #[test]
    fn token_response_without_refresh_token() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","token_type":"Bearer"}"#).expect("json");
        assert_eq!(response.access_token, "abc");
        assert_eq!(response.refresh_token, None);
    }
}
