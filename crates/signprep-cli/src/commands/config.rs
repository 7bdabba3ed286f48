//! `signprep config` commands for inspecting CLI configuration.

use anyhow::Result;
use clap::Subcommand;
use signprep_core::SigningConfig;

use crate::config::{config_path, serialize_to_huml};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the resolved configuration
    Show,

    /// Show config file path
    Path,
}

pub fn handle_config_command(cmd: ConfigCommands, resolved: &SigningConfig) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            print!("{}", serialize_to_huml(resolved));
            Ok(())
        }
        ConfigCommands::Path => show_path(),
    }
}

fn show_path() -> Result<()> {
    let path = config_path()?;
    println!("{}", path.display());
    if !path.exists() {
        println!("(file does not exist)");
    }
    Ok(())
}
