use crate::config::Config;
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use vows_common::OwnerIdentity;
use vows_editor::{validate_format, UniquenessCheck};
use vows_workspace::LocalBackend;

#[derive(Debug, Args)]
pub struct CheckSlugArgs {
    /// Slug to check
    pub slug: String,

    /// Owner asking, whose own slug does not count as taken
    #[arg(long = "as")]
    pub owner: Option<String>,
}

/// Outcome of a one-off slug check
#[derive(Debug, PartialEq, Eq)]
pub enum SlugReport {
    Invalid(String),
    Available,
    Taken,
}

pub fn check_slug(args: CheckSlugArgs, cwd: &str) -> Result<()> {
    let config = Config::load(cwd)?;
    let backend = LocalBackend::with_data_dir(config.get_data_dir(cwd))?;
    let owner = args.owner.as_deref().map(OwnerIdentity::new).transpose()?;

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(slug_report(&backend, &args.slug, owner.as_ref()))?;

    match report {
        SlugReport::Invalid(reason) => {
            println!("{} {} {}", "✗".red(), args.slug.bold(), reason);
        }
        SlugReport::Available => {
            println!("{} {} is available", "✓".green(), args.slug.bold());
        }
        SlugReport::Taken => {
            println!("{} {} is already taken", "✗".red(), args.slug.bold());
        }
    }

    Ok(())
}

pub async fn slug_report(
    backend: &LocalBackend,
    slug: &str,
    owner: Option<&OwnerIdentity>,
) -> Result<SlugReport> {
    if let Err(err) = validate_format(slug) {
        return Ok(SlugReport::Invalid(err.to_string()));
    }
    if backend.is_unique(slug, owner).await? {
        Ok(SlugReport::Available)
    } else {
        Ok(SlugReport::Taken)
    }
}
