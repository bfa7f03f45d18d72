// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use prometheus::Registry;
use streaming_config::Parameters;
use streaming_core::{Context, Metrics, StreamingEngine};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Single-node streaming worker. Queries are registered through the external
/// control plane; this binary only hosts the execution core.
#[derive(Parser)]
#[command(name = "streaming-node")]
struct Args {
    /// Node parameters file (YAML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control-plane bind address, recorded for the coordinator.
    #[arg(long, default_value = "127.0.0.1:9090")]
    listen: SocketAddr,
}

fn main() -> ExitCode {
    // RUST_LOG is the only environment knob.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let parameters = match load_parameters(args.config.as_deref()) {
        Ok(parameters) => parameters,
        Err(error) => {
            error!("Failed to load configuration: {error}");
            return ExitCode::FAILURE;
        }
    };

    let registry = Registry::new();
    let context = Arc::new(Context::new(parameters, Metrics::new(&registry)));
    let engine = match StreamingEngine::new(context) {
        Ok(engine) => engine,
        Err(error) => {
            error!("Failed to start the execution core: {error}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Streaming worker up with {} worker threads, control plane at {}",
        engine.worker_count(),
        args.listen
    );

    // The launcher owns our stdin and closes it to request a clean shutdown.
    let mut sink = Vec::new();
    std::io::stdin().read_to_end(&mut sink).ok();

    info!("Shutting down");
    engine.shutdown();
    ExitCode::SUCCESS
}

fn load_parameters(path: Option<&std::path::Path>) -> Result<Parameters, String> {
    match path {
        Some(path) => {
            let raw = fs::read_to_string(path).map_err(|error| error.to_string())?;
            serde_yaml::from_str(&raw).map_err(|error| error.to_string())
        }
        None => Ok(Parameters::default()),
    }
}
