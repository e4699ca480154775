//! sow-auth demo - verify a bearer token from the command line
//!
//! Wires the verifier the way a service does: configuration from `IDP_*`
//! environment variables, one shared transport created at startup, logs via
//! `tracing`, and the transport released when the verifier is dropped.
//!
//! ```text
//! IDP_URL=https://idp.example.com/realms/sow IDP_AUDIENCE=sow-api \
//!     sow-auth-demo verify "$ACCESS_TOKEN"
//! ```

use std::io::{self, Read};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sow_auth::{TokenVerifier, VerifierConfig, VerifyError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Verify OIDC bearer tokens against an identity provider
#[derive(Parser, Debug)]
#[command(name = "sow-auth-demo", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging (-v, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a token and print its claims
    Verify {
        /// The token, `Bearer <token>`, or `-` to read it from stdin
        token: String,
    },
    /// Fetch the discovery document and list the published key ids
    Keys,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(command: Command) -> Result<ExitCode> {
    let config = VerifierConfig::from_env().context("invalid IDP_* configuration")?;
    let verifier = TokenVerifier::new(config).context("failed to initialize verifier")?;

    let code = match command {
        Command::Verify { token } => {
            let raw = read_token(&token)?;
            match verifier.verify(&raw).await {
                Ok(claims) => {
                    println!("{}", serde_json::to_string_pretty(claims.as_map())?);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    report(&e);
                    ExitCode::FAILURE
                }
            }
        }
        Command::Keys => {
            let key_set = verifier.jwks().get_key_set().await?;
            println!("jwks_uri: {}", key_set.jwks_uri());
            for key in key_set.keys() {
                println!(
                    "  kid={} kty={} use={} alg={}",
                    key.kid.as_deref().unwrap_or("-"),
                    key.kty.as_deref().unwrap_or("-"),
                    key.key_use.as_deref().unwrap_or("-"),
                    key.alg.as_deref().unwrap_or("-"),
                );
            }
            for rejected in key_set.rejected() {
                println!(
                    "  unreadable kid={}: {}",
                    rejected.kid().unwrap_or("-"),
                    rejected.reason()
                );
            }
            ExitCode::SUCCESS
        }
    };

    let discovery = verifier.discovery().stats();
    let jwks = verifier.jwks().stats();
    info!(
        discovery_fetches = discovery.fetches,
        jwks_fetches = jwks.fetches,
        stale_served = discovery.stale_served + jwks.stale_served,
        "Shutting down, releasing HTTP transport"
    );
    drop(verifier);

    Ok(code)
}

fn read_token(arg: &str) -> Result<String> {
    let raw = if arg == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read token from stdin")?;
        buf
    } else {
        arg.to_string()
    };

    let raw = raw.trim();
    if raw.get(..7).is_some_and(|scheme| scheme.eq_ignore_ascii_case("bearer ")) {
        return Ok(sow_auth::bearer_token(raw)?.to_string());
    }
    Ok(raw.to_string())
}

fn report(e: &VerifyError) {
    warn!(kind = e.kind(), error = %e, "Verification failed");
    eprintln!("HTTP {} {}", e.status_code().as_u16(), e.public_message());
    if let Some(challenge) = e.challenge() {
        eprintln!(
            "WWW-Authenticate: {}",
            challenge.to_str().unwrap_or_default()
        );
    }
}

fn init_tracing(verbose: u8, json: bool) {
    let default = match verbose {
        0 => "warn,sow_auth=info",
        1 => "info,sow_auth=debug",
        _ => "debug,sow_auth=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
