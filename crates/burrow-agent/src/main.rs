//! # burrow-agent
//!
//! Burrow tunnel binary: loads settings, connects to the broker, and serves
//! HTTP until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use burrow_server::broker::BrokerOptions;
use burrow_server::broker::manager::ConnectionManager;
use burrow_server::broker::mqtt::MqttConnector;
use burrow_server::session::{HttpAuthProvider, SessionGate};
use burrow_server::shutdown::ShutdownCoordinator;
use burrow_server::{BurrowServer, CorrelationRegistry, ServerConfig};
use burrow_settings::BurrowSettings;
use clap::Parser;

/// How long shutdown waits for the broker loop and open connections.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// REST-over-MQTT tunnel server.
#[derive(Parser, Debug)]
#[command(name = "burrow", about = "REST-over-MQTT tunnel server")]
struct Cli {
    /// Settings file (defaults to `$BURROW_CONFIG` or `~/.burrow/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP listen address, e.g. `0.0.0.0:8080`.
    #[arg(long)]
    listen: Option<String>,

    /// Broker address, e.g. `broker.local:1883`.
    #[arg(long)]
    broker: Option<String>,

    /// Log level (`error`, `warn`, `info`, `debug`, `trace`).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<BurrowSettings> {
        let mut settings = match &self.config {
            Some(path) => burrow_settings::load_settings_from_file(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => burrow_settings::load_settings().context("Failed to load settings")?,
        };
        self.apply(&mut settings);
        burrow_settings::validate(&settings).context("Invalid command line override")?;
        Ok(settings)
    }

    fn apply(&self, settings: &mut BurrowSettings) {
        if let Some(listen) = &self.listen {
            settings.http.listen_addr.clone_from(listen);
        }
        if let Some(broker) = &self.broker {
            settings.broker.address.clone_from(broker);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;

    burrow_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics = burrow_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let registry = Arc::new(CorrelationRegistry::new());
    let shutdown = Arc::new(ShutdownCoordinator::new());

    let options = BrokerOptions::from_settings(&settings)?;
    let manager = ConnectionManager::new(
        Arc::new(MqttConnector::new()),
        options,
        settings.reconnect.clone(),
        Arc::clone(&registry),
    )
    .with_fresh_client_id(settings.broker.fresh_client_id);
    shutdown.spawn(manager.run(shutdown.token()));

    let mut server = BurrowServer::new(ServerConfig::from_settings(&settings)?, registry)
        .with_metrics(metrics)
        .with_shutdown(Arc::clone(&shutdown));
    if let Some(url) = &settings.auth.url {
        let provider = HttpAuthProvider::new(url.as_str(), settings.auth.timeout())
            .context("Failed to build auth client")?;
        let gate = SessionGate::new(Arc::new(provider), settings.session.idle_timeout());
        server = server.with_sessions(Arc::new(gate));
        tracing::info!(%url, "session gating enabled");
    }

    let handle = server.listen().await.context("Failed to bind HTTP listener")?;
    tracing::info!(addr = %handle.addr, "burrow tunnel running");
    shutdown.track(handle.task);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let aborted = shutdown.drain(SHUTDOWN_TIMEOUT).await;
    if aborted > 0 {
        tracing::warn!(aborted, "forced shutdown");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_parse() {
        let cli = Cli::try_parse_from([
            "burrow",
            "--config",
            "/etc/burrow.json",
            "--listen",
            "127.0.0.1:9000",
            "--broker",
            "mqtt.local:1883",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/burrow.json")));
        assert_eq!(cli.listen.as_deref(), Some("127.0.0.1:9000"));
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::try_parse_from(["burrow", "--broker", "mqtt.local:1884", "--log-level", "warn"])
            .unwrap();
        let mut settings = BurrowSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.broker.address, "mqtt.local:1884");
        assert_eq!(settings.logging.level, "warn");
        assert_eq!(settings.http.listen_addr, BurrowSettings::default().http.listen_addr);
    }

    #[test]
    fn bad_listen_flag_rejected() {
        let cli = Cli::try_parse_from(["burrow", "--listen", "nowhere"]).unwrap();
        let mut settings = BurrowSettings::default();
        cli.apply(&mut settings);
        assert!(burrow_settings::validate(&settings).is_err());
    }
}
