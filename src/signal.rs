//! C5 — the signal controller (spec §4.5).
//!
//! Registers interest in `SIGINT`/`SIGTERM`, narrowed from the six kinds
//! `examples/unikmhz-uxum/src/signal.rs` used to register — nothing else in
//! this system reacts to `SIGQUIT`/`SIGHUP`/`SIGUSR1`/`SIGUSR2`. On first
//! receipt, waits for the watched peer process (if configured) to exit, then
//! fans the shutdown out to every other component's `Topic` and returns.

use std::sync::Arc;

use regex::Regex;
use tokio::{sync::mpsc, signal::unix};
use tracing::{debug, info, warn};

use crate::{bus::Topic, config::BunnyConfig, errors::SignalError};

fn register(kind: unix::SignalKind) -> Result<unix::Signal, SignalError> {
    unix::signal(kind).map_err(|err| SignalError::Register(err.into()))
}

/// The poll interval for the peer-process watch (spec §4.5 step 1).
const PEER_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// C5's event loop state.
pub struct SignalController {
    sig_term: unix::Signal,
    sig_int: unix::Signal,
    config_rx: mpsc::Receiver<Arc<BunnyConfig>>,
    watched_process_regex: Option<Regex>,
    shutdown: Topic<()>,
}

impl SignalController {
    /// Register signal handlers and build the controller. `shutdown` is the
    /// topic telemetry/egress/ingress/config subscribe to.
    pub fn new(
        config_rx: mpsc::Receiver<Arc<BunnyConfig>>,
        shutdown: Topic<()>,
    ) -> Result<Self, SignalError> {
        Ok(Self {
            sig_term: register(unix::SignalKind::terminate())?,
            sig_int: register(unix::SignalKind::interrupt())?,
            config_rx,
            watched_process_regex: None,
            shutdown,
        })
    }

    /// Run until a signal is received, the peer (if any) exits, and the
    /// shutdown fan-out completes.
    pub async fn run(mut self) {
        info!("signal controller is go");
        loop {
            tokio::select! {
                biased;
                Some(cfg) = self.config_rx.recv() => {
                    self.apply_config(&cfg);
                }
                name = recv_signal(&mut self.sig_term, &mut self.sig_int) => {
                    info!(signal = name, "received shutdown signal");
                    self.wait_for_peer_exit().await;
                    self.shutdown.publish(()).await;
                    info!("signal controller shutdown fan-out complete");
                    return;
                }
            }
        }
    }

    fn apply_config(&mut self, cfg: &BunnyConfig) {
        self.watched_process_regex = match &cfg.signals.watched_process_command_line_regex {
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(error = %e, "invalid watched-process regex, ignoring");
                    None
                }
            },
            None => None,
        };
    }

    async fn wait_for_peer_exit(&self) {
        let Some(regex) = &self.watched_process_regex else {
            return;
        };
        let mut system = sysinfo::System::new();
        loop {
            system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
            let still_alive = system.processes().values().any(|proc| {
                let cmdline = proc
                    .cmd()
                    .iter()
                    .map(|s| s.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ");
                regex.is_match(&cmdline)
            });
            if !still_alive {
                debug!("watched peer process no longer present");
                return;
            }
            tokio::time::sleep(PEER_POLL_INTERVAL).await;
        }
    }
}

async fn recv_signal(sig_term: &mut unix::Signal, sig_int: &mut unix::Signal) -> &'static str {
    loop {
        tokio::select! {
            ret = sig_term.recv() => {
                if ret.is_some() {
                    return "SIGTERM";
                }
                warn!("SIGTERM handler exited, restarting");
                if let Ok(s) = register(unix::SignalKind::terminate()) {
                    *sig_term = s;
                }
            }
            ret = sig_int.recv() => {
                if ret.is_some() {
                    return "SIGINT";
                }
                warn!("SIGINT handler exited, restarting");
                if let Ok(s) = register(unix::SignalKind::interrupt()) {
                    *sig_int = s;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_matches_peer_cmdline() {
        let regex = Regex::new("my-app$").unwrap();
        assert!(regex.is_match("/usr/bin/my-app"));
        assert!(!regex.is_match("/usr/bin/other"));
    }
}
