//! DNI-IM command-line client.
//!
//! Runs a node in the terminal: peers are discovered over the LAN or via a
//! relay, messages are end-to-end encrypted, and anything sent to an
//! offline peer queues until it reappears.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dni_im_core::{Config, Error};

mod commands;

/// DNI-IM - peer-to-peer encrypted messaging
#[derive(Parser)]
#[command(name = "dni-im")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize an identity (also happens automatically on first start)
    Init {
        /// Display name advertised to peers
        #[arg(short, long, default_value = "anonymous")]
        name: String,
    },

    /// Show the local identity
    Identity,

    /// Run the node interactively
    Start {
        /// UDP port to bind
        #[arg(short, long)]
        port: Option<u16>,

        /// Relay host (enables the relay backend)
        #[arg(long)]
        relay: Option<String>,

        /// Relay UDP port
        #[arg(long)]
        relay_port: Option<u16>,

        /// Disable mDNS discovery
        #[arg(long)]
        no_lan: bool,
    },

    /// Send a single message, waiting briefly for delivery
    Send {
        /// Recipient fingerprint (16 hex characters)
        fingerprint: String,

        /// Message text
        message: String,

        /// Stream id
        #[arg(short, long, default_value = "1")]
        stream: u16,

        /// Relay host (enables the relay backend)
        #[arg(long)]
        relay: Option<String>,
    },

    /// List pinned contacts
    Contacts,

    /// Rename a contact
    Rename {
        /// Contact fingerprint
        fingerprint: String,

        /// New display name
        name: String,
    },

    /// Forget a contact's pinned key (the next handshake pins anew)
    Forget {
        /// Contact fingerprint
        fingerprint: String,
    },

    /// Show queued messages per recipient
    Queue,
}

fn build_config(cli: &Cli) -> Config {
    let mut config = Config::from_env();
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.into();
    }
    config
}

/// Map core failures onto the documented exit codes.
fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<Error>() {
        Some(Error::Identity(_)) => 1,
        Some(Error::Socket(_)) => 2,
        Some(Error::Storage(_)) | Some(Error::QueuePersistFailure(_)) => 3,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = build_config(&cli);

    let result = match cli.command {
        Commands::Init { ref name } => commands::init(&config, name),
        Commands::Identity => commands::show_identity(&config),
        Commands::Start { port, ref relay, relay_port, no_lan } => {
            let mut config = config.clone();
            if let Some(port) = port {
                config.udp_port = port;
            }
            if relay.is_some() {
                config.relay_address = relay.clone();
            }
            if let Some(relay_port) = relay_port {
                config.relay_port = relay_port;
            }
            if no_lan {
                config.use_lan_discovery = false;
            }
            commands::start(config).await
        }
        Commands::Send { ref fingerprint, ref message, stream, ref relay } => {
            let mut config = config.clone();
            if relay.is_some() {
                config.relay_address = relay.clone();
            }
            commands::send_once(config, fingerprint, message, stream).await
        }
        Commands::Contacts => commands::list_contacts(&config),
        Commands::Rename { ref fingerprint, ref name } => {
            commands::rename_contact(&config, fingerprint, name)
        }
        Commands::Forget { ref fingerprint } => commands::forget_contact(&config, fingerprint),
        Commands::Queue => commands::queue_status(&config),
    };

    if let Err(error) = result {
        eprintln!("error: {error:#}");
        std::process::exit(exit_code(&error));
    }
}
