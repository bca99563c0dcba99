use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use dashmap::DashMap;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use simlink_core::{logging, Config};
use simlink_rpc::RpcCallDispatcher;
use simlink_streaming::{StreamId, StreamSubscriptionRegistry, StreamToken};

#[derive(Parser, Debug)]
#[command(name = "simlink")]
#[command(about = "Client for simulator sensor streams and RPC", long_about = None)]
struct Args {
    /// Configuration file (toml, yaml or json)
    #[arg(long, env = "SIMLINK_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to sensor streams and log what arrives
    Stream {
        /// Stream tokens: "7", "7@:2001", "7@10.0.0.2:2001", "7@[::1]:2001"
        #[arg(required = true)]
        tokens: Vec<String>,

        /// Address for tokens without one ("host" or "host:port")
        #[arg(long)]
        fallback: Option<String>,

        /// Stop after this long (e.g. "30s"); runs until Ctrl-C when unset
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },

    /// Invoke a remote procedure and print its result
    Call {
        method: String,

        /// Arguments, each a JSON value
        args: Vec<String>,

        /// RPC server address ("host:port")
        #[arg(long)]
        address: Option<String>,

        /// Connect and call timeout (e.g. "500ms")
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Do not wait for a result
        #[arg(long = "async")]
        asynchronous: bool,
    },
}

#[derive(Debug, Default)]
struct StreamTotals {
    frames: u64,
    bytes: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    logging::init_logging(&config.logging)?;

    match args.command {
        Command::Stream {
            tokens,
            fallback,
            duration,
        } => run_stream(&config, &tokens, fallback, duration).await,
        Command::Call {
            method,
            args,
            address,
            timeout,
            asynchronous,
        } => run_call(&config, &method, &args, address, timeout, asynchronous).await,
    }
}

async fn run_stream(
    config: &Config,
    tokens: &[String],
    fallback: Option<String>,
    duration: Option<Duration>,
) -> Result<()> {
    let tokens = tokens
        .iter()
        .map(|text| text.parse::<StreamToken>().with_context(|| format!("Invalid token '{text}'")))
        .collect::<Result<Vec<_>>>()?;

    let mut streaming = config.streaming.clone();
    if let Some(fallback) = fallback {
        streaming.fallback_address = fallback;
    }
    let registry = StreamSubscriptionRegistry::from_config(&streaming)?;
    let totals: Arc<DashMap<StreamId, StreamTotals>> = Arc::new(DashMap::new());
    let runtime = Handle::current();

    for token in tokens {
        let stream_id = token.stream_id();
        let totals = Arc::clone(&totals);
        registry.subscribe(&runtime, token, move |frame: Bytes| {
            debug!(stream_id, size = frame.len(), "Frame received");
            let mut entry = totals.entry(stream_id).or_default();
            entry.frames += 1;
            entry.bytes += frame.len() as u64;
        })?;
        if let Some(endpoint) = registry.endpoint(stream_id) {
            info!(stream_id, endpoint = %endpoint, "Subscribed");
        }
    }

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        () = deadline => info!("Duration elapsed"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Received shutdown signal");
        }
    }

    registry.shutdown();

    for stream_id in sorted_stream_ids(&totals) {
        if let Some(entry) = totals.get(&stream_id) {
            info!(stream_id, frames = entry.frames, bytes = entry.bytes, "Stream totals");
        }
    }
    Ok(())
}

fn sorted_stream_ids(totals: &DashMap<StreamId, StreamTotals>) -> Vec<StreamId> {
    let mut ids: Vec<StreamId> = totals.iter().map(|entry| *entry.key()).collect();
    ids.sort_unstable();
    ids
}

async fn run_call(
    config: &Config,
    method: &str,
    args: &[String],
    address: Option<String>,
    timeout: Option<Duration>,
    asynchronous: bool,
) -> Result<()> {
    let args = parse_json_args(args)?;
    let address = address.unwrap_or_else(|| config.rpc.address.clone());
    let timeout = timeout.unwrap_or_else(|| config.rpc.timeout());

    let dispatcher = RpcCallDispatcher::connect(&address, timeout)
        .await
        .with_context(|| format!("Failed to connect to {address}"))?;

    if asynchronous {
        dispatcher.async_call(method, args)?;
        if tokio::time::timeout(timeout, dispatcher.into_transport().close())
            .await
            .is_err()
        {
            warn!(method, "Asynchronous call may not have been sent before timeout");
        }
        info!(method, "Asynchronous call sent");
        return Ok(());
    }

    let result = dispatcher.call(method, args).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn parse_json_args(args: &[String]) -> Result<Vec<Value>> {
    args.iter()
        .map(|arg| serde_json::from_str(arg).with_context(|| format!("Argument is not valid JSON: {arg}")))
        .collect()
}
