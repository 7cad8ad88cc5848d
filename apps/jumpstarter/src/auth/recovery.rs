//! Keeps a client's credentials alive while a lease is in use.
//!
//! When the access token gets close to expiry the chain tries, in order: a
//! silent refresh at the issuer, re-reading the credentials file an external
//! login may have rewritten, and finally a colored warning. The session is
//! never torn down from here.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::queue;
use parking_lot::Mutex;

use crate::auth::credentials::ClientConfig;
use crate::auth::error::AuthError;
use crate::auth::oidc::TokenRefresher;
use crate::auth::token::{self, format_duration};

pub const REFRESHED_MESSAGE: &str = "Token refreshed automatically.";
pub const RELOADED_MESSAGE: &str = "Token reloaded from login.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenMonitorConfig {
    /// Remaining lifetime under which the monitor checks more often.
    pub warning_threshold: Duration,
    /// Remaining lifetime under which recovery is attempted.
    pub refresh_threshold: Duration,
    pub check_interval: Duration,
    pub tight_check_interval: Duration,
}

impl Default for TokenMonitorConfig {
    fn default() -> Self {
        Self {
            warning_threshold: Duration::from_secs(300),
            refresh_threshold: Duration::from_secs(120),
            check_interval: Duration::from_secs(30),
            tight_check_interval: Duration::from_secs(5),
        }
    }
}

/// Pushes new credentials into the transport of the active lease.
#[async_trait]
pub trait ChannelRefresher: Send + Sync {
    async fn refresh_channel(&self, token: &str) -> Result<(), AuthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Refreshed,
    Reloaded,
    Unrecovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Notice,
    Expiring,
    Expired,
}

type Console = Box<dyn Write + Send>;

pub struct CredentialRecovery {
    credentials: Mutex<ClientConfig>,
    config_path: Option<PathBuf>,
    refresher: Arc<dyn TokenRefresher>,
    channel: Arc<dyn ChannelRefresher>,
    console: Mutex<Console>,
}

impl CredentialRecovery {
    pub fn new(
        credentials: ClientConfig,
        config_path: Option<PathBuf>,
        refresher: Arc<dyn TokenRefresher>,
        channel: Arc<dyn ChannelRefresher>,
    ) -> Self {
        Self {
            credentials: Mutex::new(credentials),
            config_path,
            refresher,
            channel,
            console: Mutex::new(Box::new(io::stderr())),
        }
    }

    /// Where warnings and recovery messages are printed. Stderr by default.
    pub fn with_console(self, console: impl Write + Send + 'static) -> Self {
        *self.console.lock() = Box::new(console);
        self
    }

    pub fn credentials(&self) -> ClientConfig {
        self.credentials.lock().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.credentials.lock().token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.credentials.lock().refresh_token.clone()
    }

    /// Runs the chain once. The first step that succeeds wins.
    pub async fn attempt_recovery(&self) -> RecoveryOutcome {
        match self.try_refresh().await {
            Ok(()) => return RecoveryOutcome::Refreshed,
            Err(err) => tracing::info!(
                target = "jumpstarter::auth::recovery",
                error = %err,
                "token refresh failed"
            ),
        }
        match self.try_reload().await {
            Ok(true) => RecoveryOutcome::Reloaded,
            Ok(false) => RecoveryOutcome::Unrecovered,
            Err(err) => {
                tracing::info!(
                    target = "jumpstarter::auth::recovery",
                    error = %err,
                    "token reload failed"
                );
                RecoveryOutcome::Unrecovered
            }
        }
    }

    /// Refresh-token grant at the token's issuer. Any failure restores the
    /// token pair exactly as it was.
    pub async fn try_refresh(&self) -> Result<(), AuthError> {
        let (token, refresh_token) = {
            let credentials = self.credentials.lock();
            (credentials.token.clone(), credentials.refresh_token.clone())
        };
        let result = self.refresh_from(token.as_deref(), refresh_token.as_deref()).await;
        if result.is_err() {
            let mut credentials = self.credentials.lock();
            credentials.token = token;
            credentials.refresh_token = refresh_token;
        }
        result
    }

    async fn refresh_from(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Result<(), AuthError> {
        let refresh_token = refresh_token.ok_or(AuthError::MissingRefreshToken)?;
        let access_token =
            access_token.ok_or_else(|| AuthError::InvalidToken("no access token".into()))?;
        let issuer = token::issuer(access_token)?;
        let response = self.refresher.refresh(&issuer, refresh_token).await?;

        let updated = {
            let mut credentials = self.credentials.lock();
            credentials.token = Some(response.access_token.clone());
            if let Some(rotated) = response.refresh_token {
                credentials.refresh_token = Some(rotated);
            }
            credentials.clone()
        };
        self.channel.refresh_channel(&response.access_token).await?;

        if let Some(path) = &self.config_path {
            if let Err(err) = updated.save(path) {
                tracing::warn!(
                    target = "jumpstarter::auth::recovery",
                    path = %path.display(),
                    error = %err,
                    "failed to save refreshed credentials"
                );
            }
        }
        tracing::info!(target = "jumpstarter::auth::recovery", "access token refreshed");
        Ok(())
    }

    /// Adopts the token from the credentials file if it is new and still
    /// valid. `Ok(false)` leaves everything untouched.
    pub async fn try_reload(&self) -> Result<bool, AuthError> {
        let Some(path) = &self.config_path else {
            return Ok(false);
        };
        let Some(stored) = ClientConfig::load_if_exists(path)? else {
            return Ok(false);
        };
        let Some(stored_token) = stored.token else {
            return Ok(false);
        };
        let (current_token, current_refresh) = {
            let credentials = self.credentials.lock();
            (credentials.token.clone(), credentials.refresh_token.clone())
        };
        if current_token.as_deref() == Some(stored_token.as_str()) {
            return Ok(false);
        }
        if !token::remaining_seconds(&stored_token).is_some_and(|remaining| remaining > 0) {
            tracing::debug!(
                target = "jumpstarter::auth::recovery",
                path = %path.display(),
                "stored token is expired"
            );
            return Ok(false);
        }

        {
            let mut credentials = self.credentials.lock();
            credentials.token = Some(stored_token.clone());
            if stored.refresh_token.is_some() {
                credentials.refresh_token = stored.refresh_token;
            }
        }
        if let Err(err) = self.channel.refresh_channel(&stored_token).await {
            let mut credentials = self.credentials.lock();
            credentials.token = current_token;
            credentials.refresh_token = current_refresh;
            return Err(err);
        }
        tracing::info!(
            target = "jumpstarter::auth::recovery",
            path = %path.display(),
            "access token reloaded from disk"
        );
        Ok(true)
    }

    /// Watches the access token until its lifetime can no longer be read.
    /// Never ends the session itself.
    pub async fn monitor(&self, config: TokenMonitorConfig) {
        let warning = config.warning_threshold.as_secs() as i64;
        let refresh = config.refresh_threshold.as_secs() as i64;
        let mut shown: Option<Severity> = None;

        loop {
            let Some(remaining) = self.token().as_deref().and_then(token::remaining_seconds) else {
                tracing::debug!(
                    target = "jumpstarter::auth::recovery",
                    "token lifetime unknown, monitor exiting"
                );
                return;
            };

            if remaining <= refresh {
                match self.attempt_recovery().await {
                    RecoveryOutcome::Refreshed => {
                        self.print(Color::Green, false, REFRESHED_MESSAGE);
                        shown = None;
                    }
                    RecoveryOutcome::Reloaded => {
                        self.print(Color::Green, false, RELOADED_MESSAGE);
                        shown = None;
                    }
                    RecoveryOutcome::Unrecovered => {
                        let severity = if remaining > 0 {
                            Severity::Expiring
                        } else {
                            Severity::Expired
                        };
                        if shown != Some(severity) {
                            self.warn(severity, remaining);
                            shown = Some(severity);
                        }
                    }
                }
            } else if remaining <= warning && shown.is_none() {
                self.warn(Severity::Notice, remaining);
                shown = Some(Severity::Notice);
            }

            let remaining = self
                .token()
                .as_deref()
                .and_then(token::remaining_seconds)
                .unwrap_or(remaining);
            let interval = if remaining > warning {
                config.check_interval
            } else {
                config.tight_check_interval
            };
            tokio::time::sleep(interval).await;
        }
    }

    fn warn(&self, severity: Severity, remaining: i64) {
        let duration = format_duration(remaining);
        match severity {
            Severity::Notice => self.print(
                Color::Yellow,
                false,
                &format!("Token expires in {duration}. Will attempt automatic refresh."),
            ),
            Severity::Expiring => self.print(
                Color::Yellow,
                true,
                &format!(
                    "Token expires in {duration} and could not be refreshed. \
                     Run 'jmp login' in another terminal; the session will continue."
                ),
            ),
            Severity::Expired => self.print(
                Color::Red,
                true,
                &format!(
                    "Token expired {duration} ago. The session will continue but lease \
                     cleanup may fail on exit. Run 'jmp login' to recover."
                ),
            ),
        }
    }

    fn print(&self, color: Color, bold: bool, message: &str) {
        let mut console = self.console.lock();
        if let Err(err) = write_styled(&mut *console, color, bold, message) {
            tracing::debug!(
                target = "jumpstarter::auth::recovery",
                error = %err,
                "failed to write console message"
            );
        }
    }
}

fn write_styled<W: Write>(out: &mut W, color: Color, bold: bool, message: &str) -> io::Result<()> {
    queue!(out, SetForegroundColor(color))?;
    if bold {
        queue!(out, SetAttribute(Attribute::Bold))?;
    }
    queue!(
        out,
        Print(message),
        SetAttribute(Attribute::Reset),
        ResetColor,
        Print("\n")
    )?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::oidc::TokenResponse;
    use crate::auth::token::testing::token_with_lifetime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ISSUER: &str = "https://dex.example.com";

    struct StubRefresher {
        response: Result<TokenResponse, String>,
        calls: AtomicUsize,
    }

    impl StubRefresher {
        fn ok(access_token: String, refresh_token: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(TokenResponse {
                    access_token,
                    refresh_token: refresh_token.map(str::to_string),
                    expires_in: Some(3600),
                }),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                response: Err("invalid_grant".into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TokenRefresher for StubRefresher {
        async fn refresh(&self, issuer: &str, _refresh_token: &str) -> Result<TokenResponse, AuthError> {
            assert_eq!(issuer, ISSUER);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.clone().map_err(AuthError::Provider)
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        tokens: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl ChannelRefresher for RecordingChannel {
        async fn refresh_channel(&self, token: &str) -> Result<(), AuthError> {
            if self.fail {
                return Err(AuthError::Channel("lease transport closed".into()));
            }
            self.tokens.lock().push(token.to_string());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    fn credentials(token: &str, refresh: Option<&str>) -> ClientConfig {
        ClientConfig::new("default").with_tokens(token, refresh.map(str::to_string))
    }

    #[tokio::test]
    async fn refresh_wins_over_disk_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("default.toml");
        let on_disk = token_with_lifetime(ISSUER, 7200);
        credentials(&on_disk, None).save(&path).expect("save");

        let old = token_with_lifetime(ISSUER, 60);
        let fresh = token_with_lifetime(ISSUER, 3600);
        let refresher = StubRefresher::ok(fresh.clone(), Some("rotated"));
        let channel = Arc::new(RecordingChannel::default());
        let recovery = CredentialRecovery::new(
            credentials(&old, Some("refresh-1")),
            Some(path.clone()),
            refresher.clone(),
            channel.clone(),
        );

        assert_eq!(recovery.attempt_recovery().await, RecoveryOutcome::Refreshed);
        assert_eq!(recovery.token().as_deref(), Some(fresh.as_str()));
        assert_eq!(recovery.refresh_token().as_deref(), Some("rotated"));
        assert_eq!(*channel.tokens.lock(), vec![fresh.clone()]);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        let saved = ClientConfig::load(&path).expect("load");
        assert_eq!(saved.token.as_deref(), Some(fresh.as_str()));
    }

    #[tokio::test]
    async fn provider_without_rotation_keeps_refresh_token() {
        let old = token_with_lifetime(ISSUER, 60);
        let fresh = token_with_lifetime(ISSUER, 3600);
        let recovery = CredentialRecovery::new(
            credentials(&old, Some("refresh-1")),
            None,
            StubRefresher::ok(fresh, None),
            Arc::new(RecordingChannel::default()),
        );
        recovery.try_refresh().await.expect("refresh");
        assert_eq!(recovery.refresh_token().as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn disk_write_failure_does_not_fail_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").expect("write");
        let old = token_with_lifetime(ISSUER, 60);
        let recovery = CredentialRecovery::new(
            credentials(&old, Some("refresh-1")),
            Some(blocker.join("default.toml")),
            StubRefresher::ok(token_with_lifetime(ISSUER, 3600), None),
            Arc::new(RecordingChannel::default()),
        );
        recovery.try_refresh().await.expect("refresh succeeds");
    }

    #[tokio::test]
    async fn failed_exchange_leaves_tokens_unchanged() {
        let old = token_with_lifetime(ISSUER, 60);
        let recovery = CredentialRecovery::new(
            credentials(&old, Some("refresh-1")),
            None,
            StubRefresher::failing(),
            Arc::new(RecordingChannel::default()),
        );
        assert!(matches!(recovery.try_refresh().await, Err(AuthError::Provider(_))));
        assert_eq!(recovery.token().as_deref(), Some(old.as_str()));
        assert_eq!(recovery.refresh_token().as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn failed_channel_update_rolls_back() {
        let old = token_with_lifetime(ISSUER, 60);
        let channel = Arc::new(RecordingChannel {
            fail: true,
            ..RecordingChannel::default()
        });
        let recovery = CredentialRecovery::new(
            credentials(&old, Some("refresh-1")),
            None,
            StubRefresher::ok(token_with_lifetime(ISSUER, 3600), Some("rotated")),
            channel,
        );
        assert!(matches!(recovery.try_refresh().await, Err(AuthError::Channel(_))));
        assert_eq!(recovery.token().as_deref(), Some(old.as_str()));
        assert_eq!(recovery.refresh_token().as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn reload_used_when_refresh_is_impossible() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("default.toml");
        let on_disk = token_with_lifetime(ISSUER, 7200);
        credentials(&on_disk, Some("from-login")).save(&path).expect("save");

        let old = token_with_lifetime(ISSUER, 60);
        let refresher = StubRefresher::failing();
        let channel = Arc::new(RecordingChannel::default());
        let recovery = CredentialRecovery::new(
            credentials(&old, None),
            Some(path),
            refresher.clone(),
            channel.clone(),
        );

        assert!(matches!(
            recovery.try_refresh().await,
            Err(AuthError::MissingRefreshToken)
        ));
        assert_eq!(recovery.attempt_recovery().await, RecoveryOutcome::Reloaded);
        assert_eq!(recovery.token().as_deref(), Some(on_disk.as_str()));
        assert_eq!(recovery.refresh_token().as_deref(), Some("from-login"));
        assert_eq!(*channel.tokens.lock(), vec![on_disk]);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reload_skips_expired_or_identical_tokens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("default.toml");
        let old = token_with_lifetime(ISSUER, 60);
        let recovery = CredentialRecovery::new(
            credentials(&old, None),
            Some(path.clone()),
            StubRefresher::failing(),
            Arc::new(RecordingChannel::default()),
        );

        assert!(!recovery.try_reload().await.expect("missing file"));

        credentials(&old, None).save(&path).expect("save");
        assert!(!recovery.try_reload().await.expect("identical"));

        credentials(&token_with_lifetime(ISSUER, -10), None).save(&path).expect("save");
        assert!(!recovery.try_reload().await.expect("expired"));

        assert_eq!(recovery.attempt_recovery().await, RecoveryOutcome::Unrecovered);
        assert_eq!(recovery.token().as_deref(), Some(old.as_str()));
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn monitor_refreshes_near_expiry_and_reports_it() {
        let console = SharedBuffer::default();
        let fresh = token_with_lifetime(ISSUER, 3600);
        let refresher = StubRefresher::ok(fresh.clone(), None);
        let recovery = Arc::new(
            CredentialRecovery::new(
                credentials(&token_with_lifetime(ISSUER, 60), Some("refresh-1")),
                None,
                refresher.clone(),
                Arc::new(RecordingChannel::default()),
            )
            .with_console(console.clone()),
        );

        let monitor = tokio::spawn({
            let recovery = recovery.clone();
            async move { recovery.monitor(TokenMonitorConfig::default()).await }
        });
        tokio::time::sleep(Duration::from_secs(95)).await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(recovery.token().as_deref(), Some(fresh.as_str()));
        assert!(console.text().contains(REFRESHED_MESSAGE));
        assert!(!monitor.is_finished());
        monitor.abort();
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn monitor_warns_once_per_severity_and_keeps_running() {
        let console = SharedBuffer::default();
        let recovery = Arc::new(
            CredentialRecovery::new(
                credentials(&token_with_lifetime(ISSUER, -5), None),
                None,
                StubRefresher::failing(),
                Arc::new(RecordingChannel::default()),
            )
            .with_console(console.clone()),
        );

        let monitor = tokio::spawn({
            let recovery = recovery.clone();
            async move { recovery.monitor(TokenMonitorConfig::default()).await }
        });
        tokio::time::sleep(Duration::from_secs(60)).await;

        let text = console.text();
        assert_eq!(text.matches("Token expired").count(), 1, "{text}");
        assert!(!monitor.is_finished());
        monitor.abort();
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn monitor_notices_warning_window_without_refreshing() {
        let console = SharedBuffer::default();
        let refresher = StubRefresher::failing();
        let recovery = Arc::new(
            CredentialRecovery::new(
                credentials(&token_with_lifetime(ISSUER, 250), Some("refresh-1")),
                None,
                refresher.clone(),
                Arc::new(RecordingChannel::default()),
            )
            .with_console(console.clone()),
        );

        let monitor = tokio::spawn({
            let recovery = recovery.clone();
            async move { recovery.monitor(TokenMonitorConfig::default()).await }
        });
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(console.text().contains("Will attempt automatic refresh."));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        monitor.abort();
    }

    #[tokio::test]
    async fn monitor_exits_quietly_for_opaque_tokens() {
        let recovery = CredentialRecovery::new(
            credentials("opaque", Some("refresh-1")),
            None,
            StubRefresher::failing(),
            Arc::new(RecordingChannel::default()),
        )
        .with_console(SharedBuffer::default());
        tokio::time::timeout(Duration::from_secs(1), recovery.monitor(TokenMonitorConfig::default()))
            .await
            .expect("monitor returns");
    }
}
