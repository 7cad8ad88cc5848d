use std::env;
use std::time::Duration;

use crate::auth::recovery::TokenMonitorConfig;
use crate::client::status_monitor::StatusMonitorConfig;
use crate::exporter::hooks::{DEFAULT_HOOK_TIMEOUT_SECS, HookConfig, HookExecutor};

const DEFAULT_POLL_MS: u64 = 300;
const DEFAULT_SLOW_POLL_MS: u64 = 5_000;
const DEFAULT_TOKEN_WARNING_SECS: u64 = 300;
const DEFAULT_TOKEN_REFRESH_SECS: u64 = 120;
const DEFAULT_TOKEN_CHECK_SECS: u64 = 30;
const DEFAULT_TOKEN_TIGHT_CHECK_SECS: u64 = 5;
const DEFAULT_READ_CHUNK: usize = 64 * 1024;
const MIN_READ_CHUNK: usize = 1024;

/// Process-wide tunables, read from `JMP_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub status_poll_interval: Duration,
    pub status_slow_poll_interval: Duration,
    pub token_warning_threshold: Duration,
    pub token_refresh_threshold: Duration,
    pub token_check_interval: Duration,
    pub token_tight_check_interval: Duration,
    pub hook_timeout: Duration,
    pub read_chunk_size: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            status_poll_interval: parse_millis_env(
                "JMP_STATUS_POLL_MS",
                defaults.status_poll_interval,
            ),
            status_slow_poll_interval: parse_millis_env(
                "JMP_STATUS_SLOW_POLL_MS",
                defaults.status_slow_poll_interval,
            ),
            token_warning_threshold: parse_secs_env(
                "JMP_TOKEN_WARNING_SECS",
                defaults.token_warning_threshold,
            ),
            token_refresh_threshold: parse_secs_env(
                "JMP_TOKEN_REFRESH_SECS",
                defaults.token_refresh_threshold,
            ),
            token_check_interval: parse_secs_env(
                "JMP_TOKEN_CHECK_SECS",
                defaults.token_check_interval,
            ),
            token_tight_check_interval: parse_secs_env(
                "JMP_TOKEN_TIGHT_CHECK_SECS",
                defaults.token_tight_check_interval,
            ),
            hook_timeout: parse_secs_env("JMP_HOOK_TIMEOUT_SECS", defaults.hook_timeout),
            read_chunk_size: parse_usize_env(
                "JMP_READ_CHUNK_SIZE",
                defaults.read_chunk_size,
                MIN_READ_CHUNK,
            ),
        }
    }

    pub fn status_monitor(&self) -> StatusMonitorConfig {
        StatusMonitorConfig {
            poll_interval: self.status_poll_interval,
            slow_poll_interval: self.status_slow_poll_interval,
        }
    }

    pub fn token_monitor(&self) -> TokenMonitorConfig {
        TokenMonitorConfig {
            warning_threshold: self.token_warning_threshold,
            refresh_threshold: self.token_refresh_threshold,
            check_interval: self.token_check_interval,
            tight_check_interval: self.token_tight_check_interval,
        }
    }

    pub fn hook_executor(&self, hooks: HookConfig) -> HookExecutor {
        HookExecutor::new(hooks).with_default_timeout(self.hook_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            status_poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            status_slow_poll_interval: Duration::from_millis(DEFAULT_SLOW_POLL_MS),
            token_warning_threshold: Duration::from_secs(DEFAULT_TOKEN_WARNING_SECS),
            token_refresh_threshold: Duration::from_secs(DEFAULT_TOKEN_REFRESH_SECS),
            token_check_interval: Duration::from_secs(DEFAULT_TOKEN_CHECK_SECS),
            token_tight_check_interval: Duration::from_secs(DEFAULT_TOKEN_TIGHT_CHECK_SECS),
            hook_timeout: Duration::from_secs(DEFAULT_HOOK_TIMEOUT_SECS),
            read_chunk_size: DEFAULT_READ_CHUNK,
        }
    }
}

fn parse_u64_env(var: &str) -> Option<u64> {
    let value = env::var(var).ok()?;
    match value.trim().parse::<u64>() {
        Ok(parsed) if parsed > 0 => Some(parsed),
        Ok(parsed) => {
            tracing::warn!(
                target = "jumpstarter::config",
                var,
                parsed,
                "value must be positive; using default"
            );
            None
        }
        Err(err) => {
            tracing::warn!(
                target = "jumpstarter::config",
                var,
                error = %err,
                "invalid numeric env; using default"
            );
            None
        }
    }
}

fn parse_millis_env(var: &str, default: Duration) -> Duration {
    parse_u64_env(var)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn parse_secs_env(var: &str, default: Duration) -> Duration {
    parse_u64_env(var).map(Duration::from_secs).unwrap_or(default)
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match parse_u64_env(var).map(usize::try_from) {
        Some(Ok(parsed)) if parsed >= min => parsed,
        Some(_) => {
            tracing::warn!(
                target = "jumpstarter::config",
                var,
                min,
                default,
                "value below minimum; using default"
            );
            default
        }
        None => default,
    }
}
