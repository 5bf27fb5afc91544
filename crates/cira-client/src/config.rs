//! Session configuration

use std::time::Duration;

use cira_transport::ProxyConfig;
use thiserror::Error;
use uuid::Uuid;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("invalid client UUID {value:?}: {source}")]
    InvalidUuid {
        value: String,
        #[source]
        source: uuid::Error,
    },
}

/// Immutable per-session configuration. Validated once at construction and
/// read-only for the session's lifetime.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Management server to dial out to
    pub mps_host: String,
    pub mps_port: u16,

    /// Credentials for password authentication
    pub username: String,
    pub password: String,

    /// Keepalive period once every forward is registered
    pub keepalive_interval: Duration,

    /// Name announced in forward registrations
    pub client_name: String,

    /// Device identity carried in the protocol version frame
    pub client_uuid: Uuid,

    /// Where channel traffic is relayed to
    pub device_address: String,

    /// Reach the TLS sibling of each service on port + 1
    pub tls_upgrade: bool,

    /// Optional proxy between us and the management server
    pub proxy: Option<ProxyConfig>,

    /// Verify the management server's certificate. Off by default: the
    /// server ordinarily presents a self-signed certificate.
    pub verify_server_cert: bool,

    /// Overall timeout covering the TCP dial, proxy negotiation, and the
    /// TLS handshake
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    mps_host: String,
    mps_port: u16,
    username: String,
    password: String,
    keepalive_interval: Option<Duration>,
    client_name: String,
    client_uuid: String,
    device_address: String,
    tls_upgrade: bool,
    proxy: Option<ProxyConfig>,
    verify_server_cert: bool,
    connect_timeout: Option<Duration>,
}

impl ClientConfigBuilder {
    pub fn mps(mut self, host: impl Into<String>, port: u16) -> Self {
        self.mps_host = host.into();
        self.mps_port = port;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn client_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.client_uuid = uuid.into();
        self
    }

    pub fn device_address(mut self, address: impl Into<String>) -> Self {
        self.device_address = address.into();
        self
    }

    pub fn tls_upgrade(mut self, enabled: bool) -> Self {
        self.tls_upgrade = enabled;
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn verify_server_cert(mut self, verify: bool) -> Self {
        self.verify_server_cert = verify;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        if self.mps_host.is_empty() {
            return Err(ConfigError::Missing("mps host"));
        }
        if self.mps_port == 0 {
            return Err(ConfigError::Zero("mps port"));
        }
        if self.username.is_empty() {
            return Err(ConfigError::Missing("username"));
        }
        if self.client_name.is_empty() {
            return Err(ConfigError::Missing("client name"));
        }
        if self.device_address.is_empty() {
            return Err(ConfigError::Missing("device address"));
        }
        let client_uuid =
            Uuid::parse_str(&self.client_uuid).map_err(|source| ConfigError::InvalidUuid {
                value: self.client_uuid.clone(),
                source,
            })?;

        let keepalive_interval = self.keepalive_interval.unwrap_or(Duration::from_secs(30));
        if keepalive_interval.is_zero() {
            return Err(ConfigError::Zero("keepalive interval"));
        }

        Ok(ClientConfig {
            mps_host: self.mps_host,
            mps_port: self.mps_port,
            username: self.username,
            password: self.password,
            keepalive_interval,
            client_name: self.client_name,
            client_uuid,
            device_address: self.device_address,
            tls_upgrade: self.tls_upgrade,
            proxy: self.proxy,
            verify_server_cert: self.verify_server_cert,
            connect_timeout: self.connect_timeout.unwrap_or(Duration::from_secs(30)),
        })
    }
}
