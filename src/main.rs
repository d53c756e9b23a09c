//! `bunnysidecar` entrypoint: builds the Tokio runtime, then wires the five
//! components together over [`bus::Topic`]s in dependency order (spec §3/§4).
//!
//! Startup mirrors `examples/unikmhz-uxum/src/handle.rs`'s linear
//! init-then-run shape, but the composition itself is data (a fixed
//! subscriber order per topic) rather than a `Handle` struct threading
//! `Option<JoinHandle<_>>` fields through `start`/`wait`/`shutdown` methods:
//! this system has no supervisor API to expose, only one process to run
//! until it's told to stop.

mod bus;
mod config;
mod config_controller;
mod errors;
mod ingress;
mod logging;
mod probes;
mod runtime;
mod signal;
mod telemetry;

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};

use bus::Topic;
use config::BunnyConfig;
use telemetry::TelemetryPlane;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init(env!("CARGO_PKG_NAME"));

    let runtime_cfg = runtime::RuntimeConfig::default();
    let rt = runtime_cfg.build()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting bunnysidecar");

    // Telemetry is constructed eagerly from the default config so the plane
    // exists even before the first file load completes (spec §3 Lifecycle).
    let telemetry = Arc::new(RwLock::new(TelemetryPlane::new(
        &BunnyConfig::default().telemetry,
        env!("CARGO_PKG_VERSION"),
    )?));

    // Topics, subscribed in the dependency order spec §4.4 requires:
    // telemetry must finish applying a snapshot (and publish a ready token)
    // before egress/ingress touch the new providers.
    let mut config_updated: Topic<Arc<BunnyConfig>> = Topic::new();
    let mut telemetry_ready: Topic<()> = Topic::new();
    let mut shutdown: Topic<()> = Topic::new();

    let telemetry_config_rx = config_updated.subscribe(1);
    let probe_config_rx = config_updated.subscribe(1);
    let ingress_config_rx = config_updated.subscribe(1);
    let signal_config_rx = config_updated.subscribe(1);

    let probe_ready_rx = telemetry_ready.subscribe(1);
    let ingress_ready_rx = telemetry_ready.subscribe(1);

    let telemetry_shutdown_rx = shutdown.subscribe(1);
    let probe_shutdown_rx = shutdown.subscribe(1);
    let ingress_shutdown_rx = shutdown.subscribe(1);
    let config_shutdown_rx = shutdown.subscribe(1);

    let probe_engine = probes::ProbeEngine::new(
        Arc::clone(&telemetry),
        probe_config_rx,
        probe_ready_rx,
        probe_shutdown_rx,
    );
    let ingress_server = ingress::IngressServer::new(
        Arc::clone(&telemetry),
        ingress_config_rx,
        ingress_ready_rx,
        ingress_shutdown_rx,
    );
    let config_controller = config_controller::ConfigController::new(config_updated, config_shutdown_rx)?;
    let signal_controller = signal::SignalController::new(signal_config_rx, shutdown)?;

    let telemetry_task = tokio::spawn(run_telemetry(
        Arc::clone(&telemetry),
        telemetry_config_rx,
        telemetry_ready,
        telemetry_shutdown_rx,
    ));
    let probe_task = tokio::spawn(probe_engine.run());
    let ingress_task = tokio::spawn(ingress_server.run());
    let config_task = tokio::spawn(config_controller.run());

    // The signal controller owns the process lifetime: it returns once the
    // shutdown fan-out has been delivered to every other subscriber.
    signal_controller.run().await;

    for (name, task) in [
        ("telemetry", telemetry_task),
        ("probe engine", probe_task),
        ("ingress server", ingress_task),
        ("config controller", config_task),
    ] {
        if let Err(e) = task.await {
            error!(component = name, error = %e, "component task panicked");
        }
    }

    // By now every other `Arc<RwLock<TelemetryPlane>>` clone has been
    // dropped along with its owning task, so this is the sole owner and can
    // flush exporters before exit (spec §4.1 Shutdown).
    match Arc::try_unwrap(telemetry) {
        Ok(lock) => lock.into_inner().shutdown(),
        Err(_) => error!("telemetry plane still had outstanding references at shutdown"),
    }

    info!("bunnysidecar stopped");
    Ok(())
}

/// C1's own event loop: apply each incoming config to the shared plane, then
/// publish one [`telemetry_ready`] token per downstream subscriber (spec
/// §4.1/§4.4 stage barrier).
async fn run_telemetry(
    telemetry: Arc<RwLock<TelemetryPlane>>,
    mut config_rx: tokio::sync::mpsc::Receiver<Arc<BunnyConfig>>,
    ready: Topic<()>,
    mut shutdown_rx: tokio::sync::mpsc::Receiver<()>,
) {
    info!("telemetry plane is go");
    loop {
        tokio::select! {
            biased;
            Some(()) = shutdown_rx.recv() => {
                info!("telemetry plane shutting down");
                return;
            }
            Some(cfg) = config_rx.recv() => {
                let result = {
                    let mut plane = telemetry.write().await;
                    plane.apply(&cfg.telemetry)
                };
                if let Err(e) = result {
                    error!(error = %e, "failed to apply telemetry configuration, keeping previous providers");
                }
                ready.publish(()).await;
            }
        }
    }
}
