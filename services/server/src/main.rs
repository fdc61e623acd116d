// server: Real-time retrospective collaboration server.
//
// Clients talk to the process over two HTTP endpoints under the API prefix:
// a command POST for client-to-server messages and a server-sent event
// stream for everything flowing the other way. Room state lives in memory
// and dies with the process.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, Command};
use server::manager::RoomManager;
use sse_broker::Broker;
use tracing::info;

const API_PREFIX: &str = "/api/";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("retro-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Real-time server for facilitator-led retrospectives")
        .arg(
            Arg::new("listen")
                .long("listen")
                .value_name("ADDR")
                .default_value("127.0.0.1:1407")
                .help("Address on which to listen"),
        )
        .arg(
            Arg::new("ui")
                .long("ui")
                .value_name("DIR")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Directory with the UI files. If unset, do not serve UI files"),
        )
        .get_matches();

    let listen = matches
        .get_one::<String>("listen")
        .expect("listen has a default")
        .clone();
    let ui_dir = matches.get_one::<PathBuf>("ui").cloned();

    let broker = Broker::new(API_PREFIX);
    let _reaper = broker.start_reaper();
    RoomManager::start(Arc::clone(&broker)).await;

    if let Some(dir) = &ui_dir {
        info!(dir = %dir.display(), "serving UI files");
    }

    let router = server::build_router(broker, ui_dir);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .expect("failed to bind");
    info!(addr = %listen, "server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("server shut down gracefully");
}

/// Resolves once the process is asked to stop, triggering graceful shutdown.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received, shutting down");
}
