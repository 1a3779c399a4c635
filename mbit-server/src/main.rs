//! micro:bit Simulator Hub daemon
//!
//! Listens for client connections and hosts one simulated device per
//! connection. Usage: `mbit-hub [config.json]`. Without an argument the
//! config is read from `$XDG_CONFIG_HOME/mbit-hub/config.json` when that
//! file exists; otherwise built-in defaults are used.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use mbit_hub::{HubConfig, SessionManager, SimEvent};
use mbit_sim::RadioDomain;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Get the XDG config directory for the hub
/// Uses $XDG_CONFIG_HOME/mbit-hub on Linux/macOS, falls back to ~/.config/mbit-hub
fn config_dir() -> Option<PathBuf> {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config);
        if path.is_absolute() {
            return Some(path.join("mbit-hub"));
        }
    }

    dirs::home_dir().map(|h| h.join(".config").join("mbit-hub"))
}

fn load_config(arg: Option<String>) -> anyhow::Result<HubConfig> {
    if let Some(path) = arg {
        tracing::info!("Loading config from {}", path);
        return HubConfig::load(&path).with_context(|| format!("loading {}", path));
    }

    match config_dir().map(|dir| dir.join("config.json")) {
        Some(path) if path.exists() => {
            tracing::info!("Loading config from {}", path.display());
            HubConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        _ => {
            tracing::info!("No config file, using defaults");
            Ok(HubConfig::default())
        }
    }
}

/// Mirror observer events into the log
async fn log_events(hub: SessionManager) {
    let mut events = hub.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                if event.is_session_lifecycle() || matches!(event, SimEvent::Error { .. }) {
                    tracing::info!("{}", serde_json::to_string(&event).unwrap_or_default());
                } else {
                    tracing::trace!("{:?}", event);
                }
            }
            Err(RecvError::Lagged(n)) => tracing::warn!("Event log skipped {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mbit_server=info,mbit_hub=info,mbit_sim=info,mbit_protocol=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting micro:bit simulator hub");

    let config = load_config(std::env::args().nth(1))?;
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    let domain = Arc::new(RadioDomain::new(config.radio.clone()));
    let hub = SessionManager::new(config, domain);
    tokio::spawn(log_events(hub.clone()));

    let server = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.serve(listener).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("Interrupted");
    hub.shutdown().await;

    server.await.context("accept loop panicked")??;
    Ok(())
}
