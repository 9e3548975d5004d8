//! # Nexus SFU
//!
//! Process entry point for the selective forwarding relay:
//! - HTTP signaling listener (publish / subscribe / teardown)
//! - Router registry with its periodic liveness sweep
//! - Stream-removed notifications forwarded to `/events` sockets

use clap::Parser;
use nexus_common::gateway_event::StreamEvent;
use nexus_sfu::handler::{SignalingState, build_router};
use nexus_sfu::{CleanedStreams, RouterSettings, RtcNegotiator, SfuServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "nexus-sfu", version, about = "Nexus selective forwarding media relay")]
struct Cli {
    /// Config file (without extension); defaults to ./config.toml when present.
    #[arg(short, long, env = "NEXUS_CONFIG")]
    config: Option<String>,

    /// Override `server.host`.
    #[arg(long)]
    host: Option<String>,

    /// Override `server.port`.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = nexus_common::config::init(cli.config.as_deref())?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nexus=debug,nexus_sfu=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting Nexus SFU v{}", env!("CARGO_PKG_VERSION"));

    let host = cli.host.unwrap_or_else(|| config.server.host.clone());
    let port = cli.port.unwrap_or(config.server.port);
    let addr = SocketAddr::new(host.parse()?, port);

    // === Router registry ===
    let negotiator = Arc::new(RtcNegotiator::new(&config.webrtc));
    let settings = RouterSettings::from_config(&config.router, &config.buffer);
    if settings.buffer.is_none() {
        tracing::info!("Buffering stage disabled; NACKs go straight to publishers");
    }
    let (sfu, cleaned) = SfuServer::new(negotiator, settings, config.router.cleaned_queue);

    let shutdown = CancellationToken::new();
    let sweeper = sfu.spawn_sweeper(config.router.sweep_interval(), shutdown.clone());

    // === Stream lifecycle events ===
    // Swept streams are drained from the registry's queue and fanned out to
    // every connected `/events` socket.
    let (events_tx, _) = broadcast::channel::<StreamEvent>(1024);
    let relay = tokio::spawn(relay_cleaned(cleaned, events_tx.clone()));

    // === Signaling HTTP ===
    let state = SignalingState {
        sfu: sfu.clone(),
        events: events_tx,
        announced_ip: config.server.announced_ip.clone(),
    };
    let app = build_router(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http());

    tracing::info!("Signaling listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    sfu.shutdown().await;
    sweeper.await?;
    relay.abort();

    tracing::info!("Nexus SFU stopped");
    Ok(())
}

async fn relay_cleaned(mut cleaned: CleanedStreams, events: broadcast::Sender<StreamEvent>) {
    while let Some(key) = cleaned.recv().await {
        // No receivers just means no socket is connected right now
        let _ = events.send(StreamEvent::StreamRemoved { key });
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        }
        _ = shutdown.cancelled() => {}
    }
    tracing::info!("Shutdown requested");
}
