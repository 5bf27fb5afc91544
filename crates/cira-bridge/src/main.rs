//! CIRA bridge CLI
//!
//! Reads a JSON configuration naming one management server, an optional
//! proxy, and a list of managed clients, then runs one tunnel session per
//! client until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cira_client::{ClientConfig, ProxyConfig, ProxyKind, Session};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// CIRA bridge - outbound management tunnels for devices behind NAT
#[derive(Parser, Debug)]
#[command(name = "cira-bridge")]
#[command(about = "CIRA bridge - outbound management tunnels for devices behind NAT")]
#[command(version)]
#[command(long_about = r#"
The bridge dials out from the device network to a Management Presence
Server, authenticates, registers the AMT service ports, and relays the
server's channel traffic back to each configured device.

EXAMPLES:
  # Run with a configuration file
  cira-bridge --config bridge.json

  # Raise log verbosity
  cira-bridge --config bridge.json --log-level debug

CONFIGURATION:
  {
    "mps": { "host": "mps.example.com", "port": 4433,
             "user": "admin", "pass": "secret", "keepalive_ms": 30000 },
    "proxy": { "type": "socks", "host": "proxy.corp", "port": 1080 },
    "clients": [
      { "name": "lab-1", "address": "192.168.1.50",
        "uuid": "c7f70ef1-ba1d-4e24-a60c-5f0b84a2f417", "tls_upgrade": false }
    ]
  }
"#)]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, short = 'c', env = "CIRA_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CIRA_LOG", default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Deserialize)]
struct BridgeConfig {
    mps: MpsSection,
    #[serde(default)]
    proxy: Option<ProxySection>,
    clients: Vec<ClientSection>,
}

#[derive(Debug, Deserialize)]
struct MpsSection {
    host: String,
    port: u16,
    user: String,
    pass: String,
    #[serde(default = "default_keepalive_ms")]
    keepalive_ms: u64,
}

fn default_keepalive_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize)]
struct ProxySection {
    #[serde(rename = "type")]
    kind: String,
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct ClientSection {
    name: String,
    address: String,
    uuid: String,
    #[serde(default)]
    tls_upgrade: bool,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(log_level).with_context(|| format!("Invalid log level: {log_level}"))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

fn load_config(path: &PathBuf) -> Result<BridgeConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: BridgeConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    if config.clients.is_empty() {
        anyhow::bail!("No clients configured");
    }

    Ok(config)
}

fn proxy_config(section: &ProxySection) -> Result<ProxyConfig> {
    let kind = match section.kind.as_str() {
        "http" => ProxyKind::Http,
        "socks" => ProxyKind::Socks5,
        other => anyhow::bail!("Unsupported proxy type: {other}"),
    };
    Ok(ProxyConfig {
        kind,
        host: section.host.clone(),
        port: section.port,
    })
}

/// One validated session configuration per configured client
fn client_configs(config: &BridgeConfig) -> Result<Vec<ClientConfig>> {
    let proxy = config.proxy.as_ref().map(proxy_config).transpose()?;

    config
        .clients
        .iter()
        .map(|client| {
            let mut builder = ClientConfig::builder()
                .mps(config.mps.host.clone(), config.mps.port)
                .credentials(config.mps.user.clone(), config.mps.pass.clone())
                .keepalive_interval(Duration::from_millis(config.mps.keepalive_ms))
                .client_name(client.name.clone())
                .client_uuid(client.uuid.clone())
                .device_address(client.address.clone())
                .tls_upgrade(client.tls_upgrade);
            if let Some(proxy) = &proxy {
                builder = builder.proxy(proxy.clone());
            }
            builder
                .build()
                .with_context(|| format!("Invalid configuration for client {:?}", client.name))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("CIRA bridge starting...");

    let config = load_config(&args.config)?;
    let configs = client_configs(&config)?;

    info!("MPS: {}:{}", config.mps.host, config.mps.port);
    info!("Clients: {}", configs.len());

    let mut sessions = Vec::with_capacity(configs.len());
    for config in configs {
        let mut session = Session::new(config);
        session.connect().await;
        sessions.push(session);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    for session in &mut sessions {
        session.disconnect().await;
    }

    info!("Bridge stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "mps": { "host": "mps.example.com", "port": 4433,
                 "user": "admin", "pass": "secret", "keepalive_ms": 15000 },
        "proxy": { "type": "socks", "host": "proxy.corp", "port": 1080 },
        "clients": [
            { "name": "lab-1", "address": "192.168.1.50",
              "uuid": "c7f70ef1-ba1d-4e24-a60c-5f0b84a2f417", "tls_upgrade": true },
            { "name": "lab-2", "address": "192.168.1.51",
              "uuid": "8a2be0f2-6d53-4f41-89a2-6c1ba9aab4ab" }
        ]
    }"#;

    #[test]
    fn sample_config_parses_and_builds() {
        let config: BridgeConfig = serde_json::from_str(SAMPLE).unwrap();
        let configs = client_configs(&config).unwrap();

        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].client_name, "lab-1");
        assert!(configs[0].tls_upgrade);
        assert!(!configs[1].tls_upgrade);
        assert_eq!(
            configs[0].keepalive_interval,
            Duration::from_millis(15000)
        );
        let proxy = configs[0].proxy.as_ref().unwrap();
        assert_eq!(proxy.kind, ProxyKind::Socks5);
        assert_eq!(proxy.port, 1080);
    }

    #[test]
    fn missing_mps_section_fails() {
        let result: Result<BridgeConfig, _> = serde_json::from_str(r#"{ "clients": [] }"#);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_proxy_type_fails() {
        let section = ProxySection {
            kind: "ftp".into(),
            host: "proxy.corp".into(),
            port: 1080,
        };
        assert!(proxy_config(&section).is_err());
    }

    #[test]
    fn bad_client_uuid_fails() {
        let mut config: BridgeConfig = serde_json::from_str(SAMPLE).unwrap();
        config.clients[0].uuid = "nope".into();
        assert!(client_configs(&config).is_err());
    }
}
