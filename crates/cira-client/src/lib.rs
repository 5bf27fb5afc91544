//! CIRA client engine
//!
//! Establishes an outbound TLS tunnel from a managed endpoint to its
//! management server, drives the APF handshake, registers the forwarded
//! service ports, and relays channel traffic between the tunnel and the
//! managed device's local services.

mod channel;
mod keepalive;

pub mod config;
pub mod engine;
pub mod session;

pub use config::{ClientConfig, ClientConfigBuilder, ConfigError};
pub use engine::{Action, Engine, Event, SessionState};
pub use session::{Session, SessionError};

pub use cira_transport::{ProxyConfig, ProxyKind};
