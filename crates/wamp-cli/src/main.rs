//! wamp: WAMP-CRA credential tool and transport probe.
//!
//! Generates secrets, derives salted keys, answers challenges, and opens a
//! flow-controlled transport to a router to exchange raw messages.

mod commands;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// wamp: WAMP-CRA credentials and transport probing
#[derive(Parser)]
#[command(name = "wamp", version = "0.1.0", about = "WAMP-CRA credentials and transport probing")]
struct Cli {
    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a random alphanumeric secret
    Keygen {
        /// Number of characters (default from config, else 14)
        #[arg(short, long)]
        length: Option<usize>,
    },

    /// Derive a salted key from a secret with PBKDF2-HMAC-SHA256
    Derive {
        /// Salt from the router's challenge
        #[arg(long)]
        salt: String,
        /// PBKDF2 iteration count
        #[arg(long)]
        iterations: Option<u32>,
        /// Derived key length in bytes
        #[arg(long)]
        keylen: Option<usize>,
        /// Secret (else $WAMP_SECRET, else prompt)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Compute the signature answering a wampcra challenge
    Respond {
        /// Challenge string, signed byte-for-byte
        #[arg(long)]
        challenge: String,
        /// Salt, when the secret is salted
        #[arg(long)]
        salt: Option<String>,
        /// PBKDF2 iteration count (salted only)
        #[arg(long)]
        iterations: Option<u32>,
        /// Derived key length in bytes (salted only)
        #[arg(long)]
        keylen: Option<usize>,
        /// Secret (else $WAMP_SECRET, else prompt)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Connect to a router, send raw messages, and print what comes back
    Probe {
        /// Router URL (ws://, wss://, tcp:// or rs://)
        url: String,
        /// Message to send after connecting; repeatable
        #[arg(long = "send")]
        send: Vec<String>,
        /// How long to wait for replies before disconnecting
        #[arg(long = "wait-ms", default_value_t = 1000)]
        wait_ms: u64,
        /// Serializer to negotiate (json or msgpack)
        #[arg(long, default_value = "json")]
        serializer: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "wamp_cli=debug,wamp_client=debug,wamp_core=debug"
    } else {
        "wamp_cli=warn,wamp_client=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("wamp: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.unwrap_or_else(config::default_path);
    let cfg = config::Config::load(&config_path)?;

    match cli.command {
        Command::Keygen { length } => commands::keygen::run(length, &cfg.auth),
        Command::Derive {
            salt,
            iterations,
            keylen,
            secret,
        } => {
            let params = cfg.auth.params(iterations, keylen);
            commands::derive::run(&salt, &params, secret)
        }
        Command::Respond {
            challenge,
            salt,
            iterations,
            keylen,
            secret,
        } => {
            let params = cfg.auth.params(iterations, keylen);
            commands::respond::run(&challenge, salt.as_deref(), &params, secret)
        }
        Command::Probe {
            url,
            send,
            wait_ms,
            serializer,
        } => commands::probe::run(&url, &serializer, &send, wait_ms, cfg.transport).await,
    }
}
