//! # ikekeyd
//!
//! A small daemon around the IKEv2 negotiation engine: in-memory
//! collaborators, one UDP socket, connections from a JSON file

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use ikekeyd::config::EngineConfig;
use ikekeyd::ifaces::{MemoryCertAuthority, MemoryDnsResolver, MemoryKernel, MemoryPpkStore};
use ikekeyd::impair::Impair;
use ikekeyd::{daemon, Engine};
use tracing::error;

use crate::cli::Cli;

mod cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let raw = match std::fs::read(&cli.config) {
        Ok(raw) => raw,
        Err(err) => {
            error!("Could not read {}: {err}", cli.config.display());
            exit(1);
        }
    };
    let config: EngineConfig = match serde_json::from_slice(&raw) {
        Ok(config) => config,
        Err(err) => {
            error!("Could not parse {}: {err}", cli.config.display());
            exit(1);
        }
    };

    let mut engine = Engine::new(
        config,
        Impair::default(),
        Box::new(MemoryKernel::default()),
        Arc::new(MemoryCertAuthority::default()),
        Box::new(MemoryPpkStore::default()),
        Arc::new(MemoryDnsResolver::default()),
    );
    if let Some(conn) = &cli.initiate {
        if let Err(err) = engine.initiate(conn) {
            error!("Could not initiate {conn:?}: {err}");
            exit(1);
        }
    }

    if let Err(err) = daemon::run(engine).await {
        error!("Daemon failed: {err}");
        exit(1);
    }
}
