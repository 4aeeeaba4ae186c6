//! Unraid subscription watcher
//!
//! Opens one GraphQL subscription against an Unraid server and prints every
//! payload it receives as a line of JSON until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Map, Value};
use tracing::{error, info};
use unraid_subscriptions::{Callback, ChannelStatus, Client, ClientConfig, SubscriptionRequest};

#[derive(Parser)]
#[command(name = "unraid-watch")]
#[command(about = "Stream GraphQL subscription payloads from an Unraid server")]
#[command(version)]
struct Cli {
    /// Server host name or address
    #[arg(long, env = "UNRAID_HOST")]
    host: Option<String>,

    /// Server port
    #[arg(long, env = "UNRAID_PORT")]
    port: Option<u16>,

    /// Connect with TLS (wss://)
    #[arg(long, env = "UNRAID_USE_SSL")]
    ssl: Option<bool>,

    /// API key sent as the bearer token
    #[arg(long, env = "UNRAID_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Subscription document
    #[arg(short, long)]
    query: String,

    /// Query variable as key=value; the value is parsed as JSON when it can be
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_variable)]
    variables: Vec<(String, Value)>,

    /// Subscription name used in logs
    #[arg(long, default_value = "watch")]
    name: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_variable(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenv::dotenv();

    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = ClientConfig::from_env().context("Failed to read UNRAID_* settings")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ssl) = cli.ssl {
        config.use_ssl = ssl;
    }
    if let Some(api_key) = cli.api_key {
        config.api_key = Some(api_key);
    }

    let client = Client::builder().config(config).build()?;
    info!("Watching {}", client.endpoint().subscription_url()?);

    let variables: Map<String, Value> = cli.variables.into_iter().collect();
    let request = SubscriptionRequest::new(cli.query)
        .name(cli.name)
        .variables(variables)
        .callback(Callback::from_fn(|payload| {
            println!("{}", serde_json::to_string(&payload)?);
            Ok(())
        }));
    let channel = client.subscriptions().subscribe_request(request)?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted, stopping subscriptions");
        }
        status = channel.finished() => match status {
            ChannelStatus::Failed(e) => {
                error!("Subscription failed: {}", e);
                client.stop_all().await;
                return Err(e.into());
            }
            other => info!("Subscription ended: {:?}", other),
        },
    }

    client.stop_all().await;
    Ok(())
}
