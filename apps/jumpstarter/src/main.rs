mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use cli::{Cli, Command, DecompressArgs, DetectArgs, ForwardArgs, TokenArgs};
use jumpstarter_core::auth::ClientConfig;
use jumpstarter_core::auth::token::{self, format_duration};
use jumpstarter_core::config::Config;
use jumpstarter_core::streams::codec::{AutoDecompress, SIGNATURE_BUFFER_SIZE, detect_compression};
use jumpstarter_core::streams::reader_chunks;
use jumpstarter_core::streams::tcp::{PortForward, TcpConnector};
use jumpstarter_core::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init(&cli.logging.to_config()) {
        eprintln!("failed to initialise logging: {err}");
    }

    if let Err(err) = run(cli.command).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<()> {
    let config = Config::from_env();
    match command {
        Command::Detect(args) => detect(args).await,
        Command::Decompress(args) => decompress(args, &config).await,
        Command::Forward(args) => forward(args, &config).await,
        Command::Token(args) => token_status(args),
    }
}

async fn detect(args: DetectArgs) -> Result<()> {
    let mut file = open(&args.file).await?;
    let mut head = Vec::with_capacity(SIGNATURE_BUFFER_SIZE);
    (&mut file)
        .take(SIGNATURE_BUFFER_SIZE as u64)
        .read_to_end(&mut head)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    match detect_compression(&head) {
        Some(codec) => println!("{codec}"),
        None => println!("none"),
    }
    Ok(())
}

async fn decompress(args: DecompressArgs, config: &Config) -> Result<()> {
    let file = open(&args.file).await?;
    let mut chunks = AutoDecompress::new(reader_chunks(file, config.read_chunk_size));
    let mut out: Box<dyn AsyncWrite + Unpin + Send> = match &args.output {
        Some(path) => Box::new(
            File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut total = 0usize;
    while let Some(chunk) = chunks.next_chunk().await {
        let chunk = chunk.with_context(|| format!("failed to decompress {}", args.file.display()))?;
        total += chunk.len();
        out.write_all(&chunk).await.context("failed to write output")?;
    }
    out.flush().await.context("failed to flush output")?;
    tracing::info!(
        target = "jmp_core",
        codec = ?chunks.detected(),
        bytes = total,
        "decompressed"
    );
    Ok(())
}

async fn forward(args: ForwardArgs, config: &Config) -> Result<()> {
    let connector = TcpConnector::new(args.target.clone(), config.read_chunk_size);
    let forwarder = PortForward::bind(args.listen.as_str(), connector, config.read_chunk_size)
        .await
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    let local = forwarder.local_addr().context("failed to read listen address")?;
    eprintln!("forwarding {local} -> {}", args.target);
    forwarder
        .serve_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(target = "jmp_core", error = %err, "ctrl-c handler failed");
            }
        })
        .await
        .context("forwarder stopped")?;
    Ok(())
}

fn token_status(args: TokenArgs) -> Result<()> {
    let path = match args.config {
        Some(path) => path,
        None => ClientConfig::path_for("default").context("no default client config location")?,
    };
    let config = ClientConfig::load(&path)
        .with_context(|| format!("failed to load client config {}", path.display()))?;
    let access_token = config
        .token
        .as_deref()
        .context("client config has no access token")?;

    match token::issuer(access_token) {
        Ok(issuer) => println!("Issuer: {issuer}"),
        Err(err) => println!("Issuer: unknown ({err})"),
    }
    match token::remaining_seconds(access_token) {
        Some(remaining) if remaining < 0 => {
            println!("Status: EXPIRED ({} ago)", format_duration(remaining))
        }
        Some(remaining) => println!("Status: valid ({} remaining)", format_duration(remaining)),
        None => println!("Status: unknown (token has no expiry)"),
    }
    println!(
        "Refresh token stored: {}",
        if config.refresh_token.is_some() { "yes" } else { "no" }
    );
    Ok(())
}

async fn open(path: &Path) -> Result<File> {
    File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))
}
