//! MMD Previewer - zipped model archives served from memory

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use mmd_previewer::archive::ArchiveIndex;
use mmd_previewer::config::PreviewConfig;
use mmd_previewer::fetch::{ArchiveSource, Fetcher, ProgressCallback};
use mmd_previewer::interceptor::server;
use mmd_previewer::lifecycle::Registry;
use mmd_previewer::session::{Session, SessionError};
use mmd_previewer::storage::ReadinessStore;

#[derive(Parser)]
#[command(name = "mmd-previewer")]
#[command(version)]
#[command(about = "Preview zipped MMD models without unpacking them to a server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a model archive behind the virtual resource folder
    Serve {
        /// Archive URL (http/https) or local path
        #[arg(short, long, env = "MMD_PREVIEWER_SOURCE")]
        source: String,

        /// Encoding of entry names not stored as UTF-8 (e.g. shift_jis, gbk)
        #[arg(short, long, default_value = "utf-8")]
        encoding: String,

        /// Address of the preview origin
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Archive transfer timeout in milliseconds
        #[arg(long, default_value = "20000")]
        timeout_ms: u64,

        /// Directory with the page's own assets
        #[arg(long)]
        static_dir: Option<PathBuf>,

        /// Directory for durable state (default: ~/.local/share/mmd-previewer)
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },

    /// List the entries of a local model archive
    Inspect {
        /// Path to the .zip file
        archive: PathBuf,

        /// Encoding of entry names not stored as UTF-8
        #[arg(short, long, default_value = "utf-8")]
        encoding: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(if cli.verbose {
                "mmd_previewer=debug".parse()?
            } else {
                "mmd_previewer=warn".parse()?
            }))
            .init();
    }

    match cli.command {
        Commands::Serve {
            source,
            encoding,
            bind,
            timeout_ms,
            static_dir,
            state_dir,
        } => {
            let state_dir = match state_dir {
                Some(dir) => dir,
                None => ReadinessStore::default_dir()?,
            };

            let mut config = PreviewConfig::new(ArchiveSource::parse(&source), state_dir);
            config.encoding = encoding;
            config.bind = bind;
            config.timeout = Duration::from_millis(timeout_ms);
            config.static_dir = static_dir;
            config.validate()?;

            serve(config).await?;
        }

        Commands::Inspect { archive, encoding } => {
            let bytes = std::fs::read(&archive)
                .with_context(|| format!("Failed to read {}", archive.display()))?;
            let index = ArchiveIndex::build(bytes.into(), &encoding).await?;

            for (key, entry) in index.iter() {
                println!("{:>10}  {}  ({})", entry.size(), entry.stored_path(), key);
            }
            eprintln!("\nTotal: {} entries, {} collisions", index.len(), index.collisions());

            match index.find_descriptor() {
                Some(entry) => println!("Model: {}", entry.stored_path()),
                None => bail!("No model file found in {}", archive.display()),
            }
        }
    }

    Ok(())
}

async fn serve(config: PreviewConfig) -> Result<()> {
    let registry = Arc::new(Registry::new());
    let addr = server::serve(config.bind, registry.clone(), config.static_dir.clone()).await?;

    let store = ReadinessStore::at(&config.state_dir, &format!("http://{}", addr));
    let mut session = Session::connect(&registry, &store).await?;
    let fetcher = Fetcher::new(config.timeout)?;

    println!("Loading {}", config.source.description());

    let ready = loop {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.blue} [{bar:30.white/dim}] {bytes}/{total_bytes} ({percent}%)")?
                .progress_chars("=>-"),
        );
        let bar = pb.clone();
        let progress: ProgressCallback = Box::new(move |p| {
            if let Some(total) = p.total {
                bar.set_length(total);
            }
            bar.set_position(p.loaded);
        });

        let result = session
            .load(&fetcher, &config.source, &config.encoding, Some(&progress))
            .await;
        pb.finish_and_clear();

        match result {
            Ok(ready) => break ready,
            Err(e) if e.is_retryable() => {
                eprintln!("Load failed: {}", e);
                if !prompt_retry().await? {
                    return Err(e.into());
                }
            }
            Err(SessionError::InvalidArchiveFormat) => {
                bail!("Invalid model archive: {}", config.source.description());
            }
            Err(e) => return Err(e.into()),
        }
    };

    println!("Model: {}", ready.descriptor_path);
    println!("Load from: http://{}{}", addr, ready.url);
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    Ok(())
}

/// Ask whether to retry; false on EOF
async fn prompt_retry() -> Result<bool> {
    eprintln!("Press Enter to retry (Ctrl+D to give up).");
    let read = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)
    })
    .await?
    .context("Failed to read from stdin")?;
    Ok(read > 0)
}
