//! RustChat reference client
//!
//! Reads lines from stdin, sends them to the server and prints every
//! broadcast it receives.

use std::net::IpAddr;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustchat::client::{ChatClient, ClientError};
use rustchat::config::{DEFAULT_HOST, DEFAULT_PORT};

/// CLI arguments for the chat client
#[derive(Parser, Debug)]
#[command(name = "rustchat-client")]
#[command(about = "RustChat - terminal chat client")]
#[command(version)]
struct ClientArgs {
    /// Server address
    #[arg(long, default_value_t = IpAddr::V4(DEFAULT_HOST))]
    host: IpAddr,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Color name written into the message envelope
    #[arg(short, long, default_value = "blue")]
    color: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = ClientArgs::parse();

    // Diagnostics only; chat text goes straight to stdout.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let client = ChatClient::new((args.host, args.port).into(), args.color);
    let input = BufReader::new(tokio::io::stdin());

    let result = client
        .run(input, tokio::io::stdout(), tokio::io::stdout())
        .await;

    match result {
        Ok(()) => {
            println!("Disconnected from server.");
            ExitCode::SUCCESS
        }
        Err(e @ ClientError::ConnectionRefused) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{}", e);
            println!("Disconnected from server.");
            ExitCode::FAILURE
        }
    }
}
