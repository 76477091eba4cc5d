mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sinetstream_client::{keys::DEFAULT_KEY_BITS, ClientSettings};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "sinetstream")]
#[command(about = "Provisioning client for a SINETStream config server")]
struct Cli {
    /// Credential bundle downloaded from the config server (auth.json)
    #[arg(long, global = true)]
    auth: Option<PathBuf>,

    /// Device private key (PEM)
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    /// Settings file layered over config/default and config/local
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Increase log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a device key pair and print its public half
    Keygen {
        /// Where to write the PKCS#8 private key [default: <config dir>/sinetstream/device.pem]
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
        bits: usize,
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },
    /// Exchange the credential for an access token
    Token,
    /// Manage public keys registered on the server
    #[command(subcommand)]
    Keys(KeyCommands),
    /// List data-stream configurations
    Configs,
    /// Download a configuration and print it merged with its secrets
    Fetch {
        name: String,
        /// Print secret values instead of placeholders
        #[arg(long)]
        show_secrets: bool,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Register the device public key
    Register {
        #[arg(long)]
        comment: Option<String>,
        /// Make this the account's default key
        #[arg(long)]
        default: bool,
    },
    /// List registered keys
    List,
    /// Delete one key by id, or all keys with --all
    Delete {
        id: Option<i64>,
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "sinetstream_client=info,sinetstream=info",
        1 => "sinetstream_client=debug,sinetstream=debug",
        _ => "sinetstream_client=trace,sinetstream=trace,reqwest=debug",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut settings = ClientSettings::load_from(cli.settings.as_deref()).context("Failed to load settings")?;
    if let Some(auth) = cli.auth {
        settings.credential_path = Some(auth);
    }
    settings.keys.private_key = cli
        .key
        .or(settings.keys.private_key.take())
        .or_else(|| commands::default_key_path().filter(|path| path.exists()));

    match cli.command {
        Commands::Keygen { out, bits, force } => {
            let out = out
                .or_else(commands::default_key_path)
                .context("No --out given and no config directory to default to")?;
            commands::keygen(&out, bits, force)
        }
        Commands::Token => commands::token(&settings).await,
        Commands::Keys(KeyCommands::Register { comment, default }) => {
            commands::register_key(&settings, comment.as_deref(), default).await
        }
        Commands::Keys(KeyCommands::List) => commands::list_keys(&settings).await,
        Commands::Keys(KeyCommands::Delete { id, all }) => commands::delete_keys(&settings, id, all).await,
        Commands::Configs => commands::list_configs(&settings).await,
        Commands::Fetch { name, show_secrets } => commands::fetch(&settings, &name, show_secrets).await,
    }
}
