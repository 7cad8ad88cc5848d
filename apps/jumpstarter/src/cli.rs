use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use jumpstarter_core::logging::{LogArea, LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "jmp-core",
    about = "Jumpstarter stream and credential tooling",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "JMP_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-area",
        value_enum,
        value_delimiter = ',',
        global = true,
        env = "JMP_LOG_AREAS",
        help = "Log these areas at debug (streams, status, hooks, auth)"
    )]
    pub areas: Vec<LogArea>,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "JMP_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            areas: self.areas.clone(),
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the compression format of a file, or `none`
    Detect(DetectArgs),
    /// Decompress a file, detecting the format from its header
    Decompress(DecompressArgs),
    /// Forward a local TCP port to a target address
    Forward(ForwardArgs),
    /// Show the lifetime of the access token in a client config
    Token(TokenArgs),
}

#[derive(Args, Debug)]
pub struct DetectArgs {
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct DecompressArgs {
    pub file: PathBuf,

    #[arg(short, long, value_name = "PATH", help = "Output file (defaults to stdout)")]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ForwardArgs {
    #[arg(long, value_name = "ADDR", help = "Local address to listen on")]
    pub listen: String,

    #[arg(long, value_name = "ADDR", help = "Address every connection is forwarded to")]
    pub target: String,
}

#[derive(Args, Debug)]
pub struct TokenArgs {
    #[arg(
        long,
        value_name = "PATH",
        env = "JMP_CLIENT_CONFIG",
        help = "Client config file (defaults to the 'default' client)"
    )]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_areas_are_comma_separated() {
        let cli = Cli::try_parse_from([
            "jmp-core",
            "--log-area",
            "streams,hooks",
            "detect",
            "image.xz",
        ])
        .expect("parse");
        assert_eq!(cli.logging.areas, vec![LogArea::Streams, LogArea::Hooks]);
        let config = cli.logging.to_config();
        assert_eq!(config.level, LogLevel::Warn);
        assert!(config.directives().contains("jumpstarter_core::streams=debug"));
    }
}
