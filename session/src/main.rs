//! Gatekeeper Session - operator command line.
//!
//! Inspects and mints session cookies with the same configuration the
//! gatekeeper runs with, and prints provider login URLs.
//!
//! # Commands
//!
//! - `gatekeeper-session decode <cookie>`: Decrypt a cookie and print the session
//! - `gatekeeper-session encode --identity <who>`: Mint a cookie for testing
//! - `gatekeeper-session login-url`: Print the Azure authorization URL
//!
//! # Configuration
//!
//! See [`gatekeeper_session::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! GATEKEEPER_COOKIE_SECRET="$(openssl rand -base64 32)" \
//! GATEKEEPER_CLIENT_ID="my-app" \
//! cargo run --bin gatekeeper-session -- encode --identity jane@example.com --groups admins
//! ```

use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use gatekeeper_session::config::Config;
use gatekeeper_session::{Provider, SessionState};

/// Gatekeeper Session - cookie and login URL tooling.
#[derive(Parser, Debug)]
#[command(name = "gatekeeper-session")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    GATEKEEPER_COOKIE_SECRET   Cookie encryption secret (required)
    GATEKEEPER_CLIENT_ID       OAuth client id (required)
    GATEKEEPER_COOKIE_FORMAT   'compact' or 'rich' (default: compact)
    GATEKEEPER_COOKIE_COMPRESS Compress rich cookies (default: false)
    GATEKEEPER_AZURE_TENANT    Azure tenant (default: common)

EXAMPLES:
    # Inspect a cookie copied from the browser
    gatekeeper-session decode 'AbCd...'

    # Mint a cookie for a test user
    gatekeeper-session encode --identity jane@example.com --expires-in 3600

    # Print the login URL
    gatekeeper-session login-url --redirect-uri https://app.example.com/oauth2/callback
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Decrypt a session cookie and print its redacted contents.
    Decode {
        /// The cookie value, base64url encoded.
        cookie: String,
    },

    /// Mint a session cookie.
    ///
    /// Without an access token the compact format only stores the identity.
    Encode {
        /// Email address or user name for the session.
        #[arg(short, long)]
        identity: String,

        /// Comma-separated group names.
        #[arg(short, long, value_delimiter = ',')]
        groups: Vec<String>,

        /// Seconds until the session expires.
        #[arg(short, long)]
        expires_in: Option<i64>,

        /// Access token to embed.
        #[arg(short, long)]
        access_token: Option<String>,

        /// Refresh token to embed.
        #[arg(short, long)]
        refresh_token: Option<String>,
    },

    /// Print the provider authorization URL.
    LoginUrl {
        /// Callback URL registered with the provider.
        #[arg(long)]
        redirect_uri: String,

        /// Opaque state echoed back by the provider.
        #[arg(long, default_value = "")]
        state: String,
    },
}

fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Command failed");
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    match cli.command {
        Command::Decode { cookie } => run_decode(&config, &cookie),
        Command::Encode {
            identity,
            groups,
            expires_in,
            access_token,
            refresh_token,
        } => {
            let mut session = SessionState::default();
            session.set_identity(&identity);
            session.groups = groups;
            session.access_token = access_token.unwrap_or_default();
            session.refresh_token = refresh_token.unwrap_or_default();
            session.created_at_now();
            if let Some(secs) = expires_in {
                let ttl = TimeDelta::try_seconds(secs)
                    .with_context(|| format!("--expires-in {secs} is out of range"))?;
                session.expires_in(ttl);
            }
            run_encode(&config, &session)
        }
        Command::LoginUrl {
            redirect_uri,
            state,
        } => run_login_url(&config, &redirect_uri, &state),
    }
}

/// Decrypts `cookie` and prints the session summary.
fn run_decode(config: &Config, cookie: &str) -> Result<()> {
    let codec = config.codec().context("Failed to build session codec")?;
    let session = codec
        .decode_cookie_value(cookie, config.cookie_compress)
        .context("Failed to decode session cookie")?;

    info!(format = %codec.format(), "Decoded session cookie");
    println!("{session}");
    if session.is_expired() {
        println!("(expired)");
    }
    Ok(())
}

/// Encrypts `session` and prints the cookie value.
fn run_encode(config: &Config, session: &SessionState) -> Result<()> {
    let codec = config.codec().context("Failed to build session codec")?;
    let value = codec
        .encode_cookie_value(session, config.cookie_compress)
        .context("Failed to encode session cookie")?;

    info!(format = %codec.format(), bytes = value.len(), "Encoded session cookie");
    println!("{value}");
    Ok(())
}

/// Prints the login URL for the configured provider.
fn run_login_url(config: &Config, redirect_uri: &str, state: &str) -> Result<()> {
    let provider = config
        .azure_provider()
        .context("Failed to build Azure provider")?;
    let url = provider.get_login_url(redirect_uri, state, &[]);

    println!("{url}");
    Ok(())
}

/// Initialize structured logging with tracing.
///
/// Configures JSON-formatted output on stderr with:
/// - Environment-based log level filtering via RUST_LOG
/// - Default log level of `info`
/// - Target and level information
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_layer = fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}
