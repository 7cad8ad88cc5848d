use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use super::ExporterConfigError;
use super::lease_context::LeaseContext;

pub const JUMPSTARTER_HOST: &str = "JUMPSTARTER_HOST";
pub const JMP_DRIVERS_ALLOW: &str = "JMP_DRIVERS_ALLOW";
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 120;
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OnFailure {
    #[default]
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "endLease")]
    EndLease,
    #[serde(rename = "exit")]
    Exit,
}

impl OnFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            OnFailure::Warn => "warn",
            OnFailure::EndLease => "endLease",
            OnFailure::Exit => "exit",
        }
    }
}

impl fmt::Display for OnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    BeforeLease,
    AfterLease,
}

impl HookKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HookKind::BeforeLease => "before_lease",
            HookKind::AfterLease => "after_lease",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookInstanceConfig {
    pub script: String,
    /// Seconds. Falls back to the executor's default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub on_failure: OnFailure,
}

impl HookInstanceConfig {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            timeout: None,
            on_failure: OnFailure::default(),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookConfig {
    #[serde(default)]
    pub before_lease: Option<HookInstanceConfig>,
    #[serde(default)]
    pub after_lease: Option<HookInstanceConfig>,
}

impl HookConfig {
    pub fn load(path: &Path) -> Result<Self, ExporterConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn get(&self, kind: HookKind) -> Option<&HookInstanceConfig> {
        match kind {
            HookKind::BeforeLease => self.before_lease.as_ref(),
            HookKind::AfterLease => self.after_lease.as_ref(),
        }
    }
}

/// A hook failed and its policy says the lease (or the exporter) must stop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HookError {
    pub message: String,
    pub on_failure: OnFailure,
    pub hook: HookKind,
}

impl HookError {
    pub fn should_shutdown_exporter(&self) -> bool {
        self.on_failure == OnFailure::Exit
    }

    pub fn should_end_lease(&self) -> bool {
        matches!(self.on_failure, OnFailure::EndLease | OnFailure::Exit)
    }
}

/// Runs lifecycle hook scripts through `sh -c`.
#[derive(Debug, Clone)]
pub struct HookExecutor {
    config: HookConfig,
    default_timeout: Duration,
}

impl Default for HookExecutor {
    fn default() -> Self {
        Self::new(HookConfig::default())
    }
}

impl HookExecutor {
    pub fn new(config: HookConfig) -> Self {
        Self {
            config,
            default_timeout: Duration::from_secs(DEFAULT_HOOK_TIMEOUT_SECS),
        }
    }

    /// Timeout for hooks that do not set their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn timeout_for(&self, hook: &HookInstanceConfig) -> Duration {
        hook.timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    pub fn has_hook(&self, kind: HookKind) -> bool {
        self.config.get(kind).is_some()
    }

    fn hook_env(ctx: &LeaseContext) -> HashMap<&'static str, String> {
        let host = ctx
            .hook_target_socket()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        HashMap::from([
            (JUMPSTARTER_HOST, host),
            (JMP_DRIVERS_ALLOW, "UNSAFE".to_string()),
            ("LEASE_NAME", ctx.lease_name().to_string()),
            ("CLIENT_NAME", ctx.client_name()),
        ])
    }

    /// Runs the configured hook of `kind`. With `on_failure = warn` a failure
    /// is logged and swallowed.
    pub async fn execute(&self, kind: HookKind, ctx: &LeaseContext) -> Result<(), HookError> {
        let Some(hook) = self.config.get(kind) else {
            tracing::debug!(target = "jumpstarter::exporter::hooks", hook = %kind, "no hook configured");
            return Ok(());
        };
        let script = hook.script.trim();
        if script.is_empty() {
            tracing::debug!(target = "jumpstarter::exporter::hooks", hook = %kind, "hook script is empty, skipping");
            return Ok(());
        }

        let first_line: String = script.lines().next().unwrap_or_default().chars().take(100).collect();
        tracing::info!(
            target = "jumpstarter::exporter::hooks",
            hook = %kind,
            lease = ctx.lease_name(),
            command = %first_line,
            "executing hook"
        );

        match self.run_process(hook, ctx).await {
            None => {
                tracing::info!(target = "jumpstarter::exporter::hooks", hook = %kind, "hook executed successfully");
                Ok(())
            }
            Some(message) => handle_failure(message, hook.on_failure, kind),
        }
    }

    /// Returns the failure message, or `None` on a zero exit.
    async fn run_process(&self, hook: &HookInstanceConfig, ctx: &LeaseContext) -> Option<String> {
        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&hook.script)
            .envs(Self::hook_env(ctx))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => return Some(format!("Error executing hook: {err}")),
        };

        let lease = ctx.lease_name().to_string();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let timeout = self.timeout_for(hook);

        let run = async {
            let (_, _, status) = tokio::join!(
                log_lines(stdout, &lease),
                log_lines(stderr, &lease),
                child.wait()
            );
            status
        };

        let result: Result<std::io::Result<ExitStatus>, _> = tokio::time::timeout(timeout, run).await;
        match result {
            Ok(Ok(status)) if status.success() => None,
            Ok(Ok(status)) => Some(match status.code() {
                Some(code) => format!("Hook failed with exit code {code}"),
                None => format!("Hook failed: {status}"),
            }),
            Ok(Err(err)) => Some(format!("Error executing hook: {err}")),
            Err(_) => {
                let message = format!("Hook timed out after {} seconds", timeout.as_secs());
                tracing::error!(target = "jumpstarter::exporter::hooks", lease = %lease, "{message}");
                stop_child(&mut child).await;
                Some(message)
            }
        }
    }
}

fn handle_failure(message: String, on_failure: OnFailure, hook: HookKind) -> Result<(), HookError> {
    if on_failure == OnFailure::Warn {
        tracing::warn!(
            target = "jumpstarter::exporter::hooks",
            hook = %hook,
            "{message} (on_failure=warn, continuing)"
        );
        return Ok(());
    }
    tracing::error!(
        target = "jumpstarter::exporter::hooks",
        hook = %hook,
        on_failure = %on_failure,
        "{message}"
    );
    Err(HookError {
        message,
        on_failure,
        hook,
    })
}

async fn log_lines<R: AsyncRead + Unpin>(reader: Option<R>, lease: &str) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(
                target = "jumpstarter::exporter::hook_output",
                lease,
                "{}",
                line.trim_end()
            ),
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(
                    target = "jumpstarter::exporter::hooks",
                    error = %err,
                    "hook output read failed"
                );
                break;
            }
        }
    }
}

/// Asks the process to terminate, then kills it if it lingers.
async fn stop_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a child we spawned and still own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    if let Err(err) = child.kill().await {
        tracing::debug!(
            target = "jumpstarter::exporter::hooks",
            error = %err,
            "failed to kill hook process"
        );
    }
}
