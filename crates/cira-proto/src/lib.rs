//! APF Protocol Definitions
//!
//! This crate defines the message types, the resumable binary codec, and the
//! GUID codec for the SSH-connection-protocol-derived framing (APF) spoken
//! between a CIRA client and a Management Presence Server.

pub mod codec;
pub mod guid;
pub mod messages;

pub use codec::{decode, encode, CodecError};
pub use guid::{guid_to_wire, wire_to_guid, GuidError};
pub use messages::*;

/// Protocol version announced during the handshake
pub const PROTOCOL_MAJOR: u32 = 1;
pub const PROTOCOL_MINOR: u32 = 0;

/// Service requested before authentication
pub const AUTH_SERVICE: &str = "auth@amt.intel.com";

/// Service requested for port forwarding
pub const PFWD_SERVICE: &str = "pfwd@amt.intel.com";

/// Global-request subtype registering a forwarded port
pub const TCPIP_FORWARD: &str = "tcpip-forward";

/// Intel AMT service ports requested for forwarding, in registration order
pub const FORWARDED_PORTS: [u16; 6] = [16992, 16993, 623, 16994, 16995, 5900];
