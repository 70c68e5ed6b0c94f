use crate::config::Config;
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vows_editor::Services;
use vows_workspace::{DataDirWatcher, LocalBackend, SessionHost};

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen on every interface instead of localhost
    #[arg(long)]
    pub public: bool,

    /// Ignore documents edited by hand in the data directory
    #[arg(long)]
    pub no_watch: bool,
}

pub fn serve(args: ServeArgs, cwd: &str) -> Result<()> {
    let config = Config::load(cwd)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid logLevel in config")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let data_dir = config.get_data_dir(cwd);
    let port = args.port.unwrap_or(config.http_port);
    let ip = if args.public { [0, 0, 0, 0] } else { [127, 0, 0, 1] };
    let addr = SocketAddr::from((ip, port));

    println!("{}", "💍 Starting vows server...".bright_blue().bold());
    println!("   Data:   {}", data_dir.display());
    println!("   Listen: {}", format!("http://{addr}").cyan());
    println!();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let backend = Arc::new(
            LocalBackend::with_data_dir(&data_dir)
                .with_context(|| format!("cannot open {}", data_dir.display()))?,
        );
        let _watcher = if args.no_watch {
            None
        } else {
            Some(DataDirWatcher::spawn(backend.clone())?)
        };

        let host = Arc::new(SessionHost::new(
            Services::from_backend(backend),
            config.to_engine_config(),
        ));
        vows_workspace::serve(addr, host).await?;
        Ok::<_, anyhow::Error>(())
    })?;

    println!("{}", "Server stopped".dimmed());
    Ok(())
}
