//! APF message types

use bytes::Bytes;

/// Wire message type numbers (the leading byte of every frame)
pub mod msg_type {
    pub const SERVICE_REQUEST: u8 = 5;
    pub const SERVICE_ACCEPT: u8 = 6;
    pub const USERAUTH_REQUEST: u8 = 50;
    pub const USERAUTH_FAILURE: u8 = 51;
    pub const USERAUTH_SUCCESS: u8 = 52;
    pub const GLOBAL_REQUEST: u8 = 80;
    pub const REQUEST_SUCCESS: u8 = 81;
    pub const CHANNEL_OPEN: u8 = 90;
    pub const CHANNEL_OPEN_CONFIRMATION: u8 = 91;
    pub const CHANNEL_OPEN_FAILURE: u8 = 92;
    pub const CHANNEL_WINDOW_ADJUST: u8 = 93;
    pub const CHANNEL_DATA: u8 = 94;
    pub const CHANNEL_CLOSE: u8 = 97;
    pub const PROTOCOL_VERSION: u8 = 192;
    pub const KEEPALIVE_REQUEST: u8 = 208;
    pub const KEEPALIVE_REPLY: u8 = 209;
    pub const KEEPALIVE_OPTIONS_REQUEST: u8 = 210;
    pub const KEEPALIVE_OPTIONS_REPLY: u8 = 211;
}

/// Reason codes carried in CHANNEL_OPEN_FAILURE
pub mod open_failure_reason {
    pub const ADMINISTRATIVELY_PROHIBITED: u32 = 1;
    pub const CONNECT_FAILED: u32 = 2;
    pub const UNKNOWN_CHANNEL_TYPE: u32 = 3;
    pub const RESOURCE_SHORTAGE: u32 = 4;
}

/// The only authentication method this protocol profile carries
pub const PASSWORD_METHOD: &str = "password";

/// Channel identifier assigned by the peer in CHANNEL_OPEN
pub type ChannelId = u32;

/// A decoded APF frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ProtocolVersion {
        major: u32,
        minor: u32,
        reserved: u32,
        guid: [u8; 16],
    },
    ServiceRequest {
        service: String,
    },
    ServiceAccept {
        service: String,
    },
    /// Password authentication. `service` is the service the authentication
    /// is for (port forwarding), not the authentication service itself.
    UserauthRequest {
        username: String,
        service: String,
        password: String,
    },
    UserauthFailure,
    UserauthSuccess,
    GlobalRequest {
        request: String,
        want_reply: bool,
        address: String,
        port: u32,
    },
    /// The bound port is present when the peer includes it; a bare tag is
    /// also valid on the wire.
    RequestSuccess {
        port: Option<u32>,
    },
    ChannelOpen {
        channel_type: String,
        sender_channel: ChannelId,
        window_size: u32,
        max_packet_size: u32,
        target_address: String,
        target_port: u32,
        origin_address: String,
        origin_port: u32,
    },
    ChannelOpenConfirmation {
        recipient_channel: ChannelId,
        sender_channel: ChannelId,
        window_size: u32,
        max_packet_size: u32,
    },
    ChannelOpenFailure {
        recipient_channel: ChannelId,
        reason: u32,
    },
    ChannelWindowAdjust {
        channel: ChannelId,
        bytes_to_add: u32,
    },
    ChannelData {
        channel: ChannelId,
        data: Bytes,
    },
    ChannelClose {
        channel: ChannelId,
    },
    KeepaliveRequest {
        cookie: u32,
    },
    KeepaliveReply {
        cookie: u32,
    },
    /// Interval and timeout are in seconds on the wire.
    KeepaliveOptionsRequest {
        interval: u32,
        timeout: u32,
    },
    KeepaliveOptionsReply {
        interval: u32,
        timeout: u32,
    },
}

impl Message {
    /// The wire type byte this message encodes to
    pub fn wire_type(&self) -> u8 {
        match self {
            Message::ProtocolVersion { .. } => msg_type::PROTOCOL_VERSION,
            Message::ServiceRequest { .. } => msg_type::SERVICE_REQUEST,
            Message::ServiceAccept { .. } => msg_type::SERVICE_ACCEPT,
            Message::UserauthRequest { .. } => msg_type::USERAUTH_REQUEST,
            Message::UserauthFailure => msg_type::USERAUTH_FAILURE,
            Message::UserauthSuccess => msg_type::USERAUTH_SUCCESS,
            Message::GlobalRequest { .. } => msg_type::GLOBAL_REQUEST,
            Message::RequestSuccess { .. } => msg_type::REQUEST_SUCCESS,
            Message::ChannelOpen { .. } => msg_type::CHANNEL_OPEN,
            Message::ChannelOpenConfirmation { .. } => msg_type::CHANNEL_OPEN_CONFIRMATION,
            Message::ChannelOpenFailure { .. } => msg_type::CHANNEL_OPEN_FAILURE,
            Message::ChannelWindowAdjust { .. } => msg_type::CHANNEL_WINDOW_ADJUST,
            Message::ChannelData { .. } => msg_type::CHANNEL_DATA,
            Message::ChannelClose { .. } => msg_type::CHANNEL_CLOSE,
            Message::KeepaliveRequest { .. } => msg_type::KEEPALIVE_REQUEST,
            Message::KeepaliveReply { .. } => msg_type::KEEPALIVE_REPLY,
            Message::KeepaliveOptionsRequest { .. } => msg_type::KEEPALIVE_OPTIONS_REQUEST,
            Message::KeepaliveOptionsReply { .. } => msg_type::KEEPALIVE_OPTIONS_REPLY,
        }
    }
}
