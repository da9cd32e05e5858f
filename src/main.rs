#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

use clap::Parser;
use pushgate::api::{AppState, app_router};
use pushgate::config::{Cli, Config};
use pushgate::services::{DispatchEngine, EngineSettings, LogReporter, Senders};
use pushgate::telemetry;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::Instrument;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli(&cli)?;
    let telemetry_guard = telemetry::init_telemetry(&config.log)?;

    pushgate::setup_panic_hook();

    let boot_span = tracing::info_span!("boot_server");
    let (listener, engine, shutdown_rx) = async {
        // Phase 1: Senders. Bad credentials must fail here, not on the first push.
        let senders = Senders::from_config(&config)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        pushgate::spawn_signal_handler(shutdown_tx);

        // Phase 2: Engine
        let engine = Arc::new(DispatchEngine::start(
            EngineSettings::from(&config.core),
            senders,
            Arc::new(LogReporter::new()),
        ));

        // Phase 3: Listener
        let addr = config.core.listen_addr();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(address = %addr, "listening");

        Ok::<_, anyhow::Error>((listener, engine, shutdown_rx))
    }
    .instrument(boot_span)
    .await?;

    // Phase 4: Serve until a shutdown signal arrives
    let router = app_router(AppState::new(Arc::clone(&engine), &config));
    let mut shutdown_rx = shutdown_rx;
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = shutdown_rx.wait_for(|&s| s).await;
    });
    if let Err(e) = server.await {
        tracing::error!(error = %e, "Server error");
    }

    // Phase 5: Drain the engine within the configured deadline
    engine.shutdown(config.core.shutdown_timeout()).await;

    telemetry_guard.shutdown();
    Ok(())
}
