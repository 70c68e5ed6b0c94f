mod commands;
mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::{
    check_slug, init, serve, show, CheckSlugArgs, InitArgs, ServeArgs, ShowArgs,
};

/// Vows CLI - wedding site editor backend
#[derive(Parser, Debug)]
#[command(name = "vows")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a vows.config.json and data directory
    Init(InitArgs),

    /// Run the editor API and preview stream
    Serve(ServeArgs),

    /// Print an owner's saved document
    Show(ShowArgs),

    /// Check a site slug's format and availability
    CheckSlug(CheckSlugArgs),
}

fn main() {
    let cli = Cli::parse();

    let cwd = match std::env::current_dir() {
        Ok(dir) => dir.display().to_string(),
        Err(err) => {
            eprintln!("{} cannot get current directory: {}", "Error:".red().bold(), err);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Init(args) => init(args, &cwd),
        Command::Serve(args) => serve(args, &cwd),
        Command::Show(args) => show(args, &cwd),
        Command::CheckSlug(args) => check_slug(args, &cwd),
    };

    if let Err(err) = result {
        eprintln!();
        eprintln!("{} {}", "Error:".red().bold(), err);
        eprintln!();
        std::process::exit(1);
    }
}
