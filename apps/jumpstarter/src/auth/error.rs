use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Toml(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid access token: {0}")]
    InvalidToken(String),
    #[error("access token does not name an issuer")]
    MissingIssuer,
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error("identity provider error: {0}")]
    Provider(String),
    #[error("channel refresh failed: {0}")]
    Channel(String),
}

impl From<toml::de::Error> for AuthError {
    fn from(value: toml::de::Error) -> Self {
        AuthError::Toml(value.to_string())
    }
}

impl From<toml::ser::Error> for AuthError {
    fn from(value: toml::ser::Error) -> Self {
        AuthError::Toml(value.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        AuthError::InvalidToken(value.to_string())
    }
}
