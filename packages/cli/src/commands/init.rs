use crate::config::{Config, DEFAULT_CONFIG_NAME};
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Document directory
    #[arg(short, long, default_value = "data")]
    pub data_dir: String,

    /// HTTP port for `vows serve`
    #[arg(short, long, default_value = "3030")]
    pub port: u16,

    /// Force overwrite existing config
    #[arg(short, long)]
    pub force: bool,
}

pub fn init(args: InitArgs, cwd: &str) -> Result<()> {
    let config_path = PathBuf::from(cwd).join(DEFAULT_CONFIG_NAME);

    // Check if config already exists
    if config_path.exists() && !args.force {
        println!(
            "{} {} already exists",
            "⚠️".yellow(),
            DEFAULT_CONFIG_NAME.bright_white()
        );
        println!("Use --force to overwrite");
        return Ok(());
    }

    println!("{}", "📝 Initializing wedding site...".bright_blue().bold());

    let data_dir = PathBuf::from(cwd).join(&args.data_dir);
    if !data_dir.exists() {
        fs::create_dir_all(&data_dir)?;
        println!("  {} Created {}/", "✓".green(), args.data_dir);
    }

    let config = Config {
        data_dir: args.data_dir.clone(),
        http_port: args.port,
        ..Config::default()
    };

    let config_json = serde_json::to_string_pretty(&config)?;
    fs::write(&config_path, config_json)?;

    println!("  {} Created {}", "✓".green(), DEFAULT_CONFIG_NAME);
    println!();
    println!("{}", "✅ Site initialized!".green().bold());
    println!();
    println!("Next steps:");
    println!("  1. Run: vows serve");
    println!("  2. Sign in: POST http://127.0.0.1:{}/api/session", args.port);
    println!("  3. Documents are saved in {}/", args.data_dir);

    Ok(())
}
