//! Log setup for the `jmp-core` binary.
//!
//! One global [`LogLevel`], raised per protocol area with [`LogArea`]. Hook
//! script output is operator-facing and stays visible at the quiet levels.
//! `JMP_LOG_FILTER` replaces the computed filter entirely.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const FILTER_ENV: &str = "JMP_LOG_FILTER";

const HOOKS_MODULE: &str = "jumpstarter_core::exporter::hooks";

/// Network stacks that flood debug output with per-frame noise.
const WIRE_CRATES: &[&str] = &[
    "h2",
    "hyper",
    "hyper_util",
    "reqwest",
    "rustls",
    "tungstenite",
    "tokio_tungstenite",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// A slice of the lease protocol that can be made verbose on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogArea {
    /// Router streams, codecs, port forwarding and the websocket transport.
    Streams,
    /// Status polling on the client and the exporter's status machine.
    Status,
    /// Lifecycle hook scripts.
    Hooks,
    /// Token monitoring, refresh and credential recovery.
    Auth,
}

impl LogArea {
    fn modules(self) -> &'static [&'static str] {
        match self {
            LogArea::Streams => &[
                "router_stream",
                "jumpstarter_core::streams",
                "jumpstarter_core::transport",
            ],
            LogArea::Status => &[
                "jumpstarter_core::client",
                "jumpstarter_core::exporter::session",
                "jumpstarter_core::exporter::lease_context",
                "jumpstarter_core::exporter::supervisor",
            ],
            LogArea::Hooks => &[HOOKS_MODULE],
            LogArea::Auth => &["jumpstarter_core::auth"],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Areas logged at debug, or trace when `level` is already trace.
    pub areas: Vec<LogArea>,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// The `EnvFilter` directives for this configuration.
    pub fn directives(&self) -> String {
        let mut directives = vec![self.level.directive().to_string()];
        if self.level < LogLevel::Info {
            directives.push(format!("{HOOKS_MODULE}=info"));
        }
        let verbose = self.level.max(LogLevel::Debug);
        for area in &self.areas {
            for module in area.modules() {
                directives.push(format!("{module}={}", verbose.directive()));
            }
        }
        if self.level >= LogLevel::Debug {
            for krate in WIRE_CRATES {
                directives.push(format!("{krate}=info"));
            }
        }
        directives.join(",")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let filter = match std::env::var(FILTER_ENV) {
        Ok(custom) => EnvFilter::new(custom),
        Err(_) => EnvFilter::new(config.directives()),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug || !config.areas.is_empty())
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    tracing::debug!(
        target = "jumpstarter::logging",
        level = config.level.directive(),
        areas = ?config.areas,
        "logging initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: LogLevel, areas: &[LogArea]) -> LogConfig {
        LogConfig {
            level,
            areas: areas.to_vec(),
            file: None,
        }
    }

    #[test]
    fn hook_output_survives_quiet_levels() {
        assert_eq!(
            config(LogLevel::Warn, &[]).directives(),
            "warn,jumpstarter_core::exporter::hooks=info"
        );
        assert_eq!(config(LogLevel::Info, &[]).directives(), "info");
    }

    #[test]
    fn areas_raise_only_their_modules() {
        let directives = config(LogLevel::Warn, &[LogArea::Streams]).directives();
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("router_stream=debug"));
        assert!(directives.contains("jumpstarter_core::transport=debug"));
        assert!(!directives.contains("jumpstarter_core::auth"));
        assert!(!directives.contains("hyper"));
    }

    #[test]
    fn trace_level_traces_areas_and_quiets_wire_crates() {
        let directives = config(LogLevel::Trace, &[LogArea::Auth]).directives();
        assert!(directives.starts_with("trace,"));
        assert!(directives.contains("jumpstarter_core::auth=trace"));
        assert!(directives.contains("h2=info"));
        assert!(directives.contains("tokio_tungstenite=info"));
    }

    #[test]
    fn directives_parse_as_a_filter() {
        for level in LogLevel::value_variants() {
            let all = config(*level, LogArea::value_variants()).directives();
            EnvFilter::try_new(&all).expect("valid filter");
        }
    }

    #[test]
    fn areas_parse_from_the_command_line() {
        assert_eq!(LogArea::from_str("hooks", true).expect("parse"), LogArea::Hooks);
        assert!(LogArea::from_str("metrics", true).is_err());
    }
}
