//! # trirpc-node
//!
//! Demo node. `serve` loads settings and exposes the built-in method set
//! over HTTP, JSON-RPC and websocket; `call` invokes a method on a running
//! node over JSON-RPC.

#![deny(unsafe_code)]

mod methods;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use trirpc_client::{HttpClient, JsonRpcClient, Params, UriClient};
use trirpc_core::Codec;
use trirpc_core::logging::init_subscriber_with_format;
use trirpc_server::{RpcServer, ServerConfig};
use trirpc_settings::{RpcSettings, load_settings};

/// trirpc demo node.
#[derive(Parser, Debug)]
#[command(name = "trirpc-node", about = "trirpc demo node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the built-in method set.
    Serve {
        /// JSON settings file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen address (overrides settings), e.g. `tcp://0.0.0.0:26657`.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Call a method on a running node.
    Call {
        /// Node address (`tcp://host:port` or an `http://` URL).
        #[arg(long, default_value = "tcp://127.0.0.1:26657")]
        addr: String,

        /// Use the direct `GET /{method}` endpoint instead of JSON-RPC.
        #[arg(long)]
        uri: bool,

        /// Method name.
        method: String,

        /// Arguments as `name=value`; values are JSON, falling back to plain strings.
        args: Vec<String>,
    },
}

/// Parse `name=value` arguments into call params.
fn parse_args(args: &[String]) -> Result<Params> {
    args.iter().try_fold(Params::new(), |params, arg| {
        let Some((name, raw)) = arg.split_once('=') else {
            bail!("argument `{arg}` is not in name=value form");
        };
        if name.is_empty() {
            bail!("argument `{arg}` has an empty name");
        }
        let value = serde_json::from_str::<Value>(raw)
            .unwrap_or_else(|_| Value::String(raw.to_owned()));
        Ok(params.with(name, value))
    })
}

fn apply_overrides(settings: &mut RpcSettings, listen: Option<String>) {
    if let Some(listen) = listen {
        settings.server.listen_address = listen;
    }
}

async fn serve(config: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    let mut settings = load_settings(config.as_deref()).context("Failed to load settings")?;
    apply_overrides(&mut settings, listen);

    init_subscriber_with_format(&settings.logging.level, settings.logging.format);

    let server_config =
        ServerConfig::from_settings(&settings).context("Invalid server settings")?;
    let registry = methods::registry().context("Failed to register methods")?;
    let handle = RpcServer::new(server_config, registry, Codec::new())
        .start()
        .await
        .context("Failed to start server")?;

    tracing::info!(
        addr = %handle.local_addr(),
        ws = %handle.ws_url(),
        "trirpc node listening"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !handle.shutdown(None).await {
        tracing::warn!("shutdown timed out");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn call(addr: &str, uri: bool, method: &str, args: &[String]) -> Result<()> {
    let params = parse_args(args)?;
    let result = if uri {
        UriClient::new(addr)?.call_value(method, &params).await
    } else {
        JsonRpcClient::new(addr)?.call_value(method, &params).await
    }
    .with_context(|| format!("call to `{method}` failed"))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, listen } => serve(config, listen).await,
        Command::Call {
            addr,
            uri,
            method,
            args,
        } => call(&addr, uri, &method, &args).await,
    }
}
