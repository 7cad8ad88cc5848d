//! Client credentials: the stored config, JWT helpers, the OIDC refresh
//! grant, and the recovery chain that runs when a token nears expiry.

pub mod credentials;
pub mod error;
pub mod oidc;
pub mod recovery;
pub mod token;

pub use credentials::ClientConfig;
pub use error::AuthError;
pub use oidc::{OidcClient, TokenRefresher, TokenResponse};
pub use recovery::{
    ChannelRefresher, CredentialRecovery, RecoveryOutcome, TokenMonitorConfig,
};
