//! Swarmkeep coordinator - serves testdata and the shared keystore to workers.
//!
//! Workers connect over TCP; a small HTTP server exposes health and status
//! for the process that drives the load test.

mod handler;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use swarmkeep::{
    Coordinator, PersistSettings, Persister, TcpCoordinator, TestdataDefinition,
};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "swarmkeep-rpc")]
#[command(about = "Testdata and keystore coordinator for distributed load tests")]
struct Args {
    /// Port workers connect to (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Port of the HTTP status server (0 = auto-assign)
    #[arg(long, default_value = "0")]
    http_port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Testdata definition file (JSON)
    #[arg(long)]
    testdata: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting swarmkeep coordinator");

    let definition = match &args.testdata {
        Some(path) => TestdataDefinition::from_file(path)
            .with_context(|| format!("loading testdata from {}", path.display()))?,
        None => {
            info!("no testdata definition given, serving keystore only");
            TestdataDefinition::default()
        }
    };

    let persister = Persister::new(PersistSettings::from_env());
    let snapshot = persister.load()?;
    if snapshot.is_some() {
        info!("continuing from persisted variable state");
    }
    let producer = definition.into_producer(snapshot.as_ref())?;

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let (transport, inbox) = TcpCoordinator::start(addr).await?;
    let transport = Arc::new(transport);

    let coordinator = Arc::new(Coordinator::new(transport.clone(), producer, persister));
    tokio::spawn(coordinator.clone().serve(inbox));

    let http_addr =
        server::start_server(coordinator.clone(), transport.clone(), &args.host, args.http_port)
            .await?;

    // Read by the process that launches the coordinator.
    println!("COORDINATOR_PORT={}", transport.addr().port());
    println!("HTTP_PORT={}", http_addr.port());

    info!(
        "coordinator running on {}, status on {}",
        transport.addr(),
        http_addr
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");

    if let Err(e) = coordinator.stop().await {
        error!("failed to persist variable state on shutdown: {}", e);
    }

    Ok(())
}
