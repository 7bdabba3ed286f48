use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use commands::config::{ConfigCommands, handle_config_command};

#[derive(Parser)]
#[command(name = "signprep")]
#[command(about = "Inspect and validate mobile code signing credentials", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory for ephemeral keychains and profile files (overrides config)
    #[arg(long, global = true)]
    temp_dir: Option<PathBuf>,

    /// Name prefix of keychains created by signprep (overrides config)
    #[arg(long, global = true)]
    keychain_prefix: Option<String>,

    /// Path to the macOS `security` tool (overrides config)
    #[arg(long, global = true)]
    security_path: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show fingerprint, common name and expiry of a .p12 distribution certificate
    InspectCert {
        /// Path to the .p12 file
        file: PathBuf,

        /// Certificate password
        #[arg(long, env = "SIGNPREP_CERT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Decode a .mobileprovision provisioning profile
    InspectProfile {
        /// Path to the .mobileprovision file
        file: PathBuf,
    },

    /// Detect the format of an Android keystore and validate its key
    Keystore {
        /// Path to the keystore file
        file: PathBuf,

        /// Keystore password
        #[arg(long, env = "SIGNPREP_KEYSTORE_PASSWORD", hide_env_values = true)]
        keystore_password: String,

        /// Key alias
        #[arg(long)]
        alias: String,

        /// Key password (defaults to the keystore password)
        #[arg(long, env = "SIGNPREP_KEY_PASSWORD", hide_env_values = true)]
        key_password: Option<String>,
    },

    /// Delete keychains left behind by interrupted builds
    CleanKeychains,

    /// Inspect CLI configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "signprep=debug,signprep_core=debug"
    } else {
        "signprep=info,signprep_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let file_config = config::load_config().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config file: {:#}", e);
        None
    });
    let flags = config::ConfigFlags {
        temp_dir: cli.temp_dir,
        keychain_prefix: cli.keychain_prefix,
        security_path: cli.security_path,
    };
    let resolved = config::resolve_config(&flags, file_config)?;

    match cli.command {
        Commands::InspectCert { file, password } => commands::ios::inspect_cert(&file, password)?,
        Commands::InspectProfile { file } => commands::ios::inspect_profile(&file, &resolved).await?,
        Commands::Keystore {
            file,
            keystore_password,
            alias,
            key_password,
        } => commands::android::check_keystore(&file, keystore_password, alias, key_password)?,
        Commands::CleanKeychains => commands::keychain::clean_keychains(&resolved).await?,
        Commands::Config(cmd) => handle_config_command(cmd, &resolved)?,
    }

    Ok(())
}
