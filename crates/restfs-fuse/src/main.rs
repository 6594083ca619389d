//! RestFS mount daemon

use anyhow::{bail, Context, Result};
use clap::Parser;
use restfs_fuse::{interrupt_signal, parse_header_arg, spawn_mount, RestFsConfig, Scheme};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "restfs")]
#[command(about = "Mount a remote HTTP(S) resource tree as a local directory", long_about = None)]
struct Cli {
    /// Directory the mount point is created in
    #[arg(long, default_value = "/tmp")]
    root: PathBuf,

    /// http or https; overrides the config file
    #[arg(long)]
    protocol: Option<Scheme>,

    /// TOML or JSON config file
    #[arg(short, long, env = "RESTFS_CONFIG")]
    config: Option<PathBuf>,

    /// Comma-separated mount options (allow_other, ro, ...)
    #[arg(short = 'o', long = "options")]
    options: Option<String>,

    /// Extra request header, `Name: value`; repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    #[arg(long)]
    concurrency: Option<usize>,

    hostname: String,
}

impl Cli {
    fn into_config(self) -> Result<(PathBuf, RestFsConfig)> {
        let mut config = match &self.config {
            Some(path) => RestFsConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => RestFsConfig::default(),
        };

        config.host = self.hostname;
        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if let Some(options) = self.options {
            config.mount_options = options;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        for raw in &self.headers {
            let Some((name, value)) = parse_header_arg(raw) else {
                bail!("header must look like 'Name: value', got {:?}", raw);
            };
            config.headers.insert(name, value);
        }

        config.validate()?;
        Ok((self.root.join(&config.host), config))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let (mount_dir, config) = Cli::parse().into_config()?;
    tracing::info!(
        "RestFS starting: {}://{} at {}",
        config.protocol,
        config.host,
        mount_dir.display()
    );

    std::fs::create_dir_all(&mount_dir)
        .with_context(|| format!("creating mount directory {}", mount_dir.display()))?;

    let adapter = config.header_adapter()?;
    let mut handle = match spawn_mount(adapter, &mount_dir, config) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("mount at {} failed: {}", mount_dir.display(), e);
            return Err(e.into());
        }
    };

    let interrupted = tokio::select! {
        _ = interrupt_signal() => true,
        _ = handle.finished() => false,
    };
    if interrupted {
        handle.unmount();
    } else {
        tracing::info!("mount at {} ended", mount_dir.display());
    }

    tokio::task::spawn_blocking(move || handle.join()).await??;
    tracing::info!("RestFS stopped");
    Ok(())
}
