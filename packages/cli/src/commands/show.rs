use crate::config::Config;
use anyhow::{anyhow, Result};
use clap::Args;
use colored::Colorize;
use vows_common::{normalize, IdGenerator, OwnerIdentity};
use vows_workspace::LocalBackend;

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Owner whose document to print
    pub owner: String,

    /// Only print this section
    #[arg(short, long)]
    pub section: Option<String>,
}

pub fn show(args: ShowArgs, cwd: &str) -> Result<()> {
    let config = Config::load(cwd)?;
    let identity = OwnerIdentity::new(&args.owner)?;
    let backend = LocalBackend::with_data_dir(config.get_data_dir(cwd))?;

    let stored = backend
        .document(&identity)
        .ok_or_else(|| anyhow!("no document for {}", identity))?;
    let document = normalize(stored, &IdGenerator::for_owner(identity.as_str()))?;

    let output = match &args.section {
        Some(section) => document
            .get(section)
            .cloned()
            .ok_or_else(|| anyhow!("document has no section {}", section))?,
        None => document.into_value(),
    };

    println!("{} {}", "📄".bright_blue(), identity.to_string().bold());
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
