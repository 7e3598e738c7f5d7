// CLI module - command-line argument parsing and handlers
//
// Subcommands:
// - server (default): run the proxy
// - config --show: display effective configuration as TOML
// - config --path: display the config file path

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use lens::config::{Config, VERSION};

/// lens - transparent telemetry proxy for streaming LLM APIs
#[derive(Debug, Parser)]
#[command(name = "lens")]
#[command(version = VERSION)]
#[command(about = "Transparent telemetry proxy for streaming LLM APIs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Commands {
    /// Run the proxy server (default)
    Server,

    /// Inspect configuration
    Config {
        /// Show effective configuration (env > file > defaults)
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

impl Cli {
    /// Subcommand to run, `server` when none was given
    pub fn command(&self) -> &Commands {
        self.command.as_ref().unwrap_or(&Commands::Server)
    }
}

/// Handle `config` flags, printing to stdout
pub fn handle_config(show: bool, path: bool) -> Result<()> {
    if path {
        return handle_config_path();
    }
    if show {
        return handle_config_show();
    }

    // No flag provided, show help
    println!("Usage: lens config [--show|--path]");
    println!();
    println!("Options:");
    println!("  --show    Display effective configuration");
    println!("  --path    Show config file path");
    Ok(())
}

fn handle_config_path() -> Result<()> {
    match Config::config_path() {
        Some(path) => {
            println!("{}", path.display());
            Ok(())
        }
        None => bail!("Could not determine config path"),
    }
}

fn handle_config_show() -> Result<()> {
    let config = Config::from_env()?;

    println!("# Effective configuration (env > file > defaults)");
    match Config::config_path() {
        Some(path) if path.exists() => println!("# Source: {}", path.display()),
        _ => println!("# Source: defaults (no config file)"),
    }
    println!();
    print!("{}", config.to_toml());
    Ok(())
}
