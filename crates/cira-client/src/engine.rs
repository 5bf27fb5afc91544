//! Session protocol engine
//!
//! The engine is deliberately free of IO. It consumes bytes received from
//! the transport plus relay and timer events, and produces the actions the
//! driver must apply: frames to write, local connections to dial or close,
//! keepalive timer changes. Keeping all protocol logic here means the
//! handshake and the whole channel lifecycle can be exercised without a
//! socket.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use cira_proto::{
    codec, open_failure_reason, ChannelId, Message, AUTH_SERVICE, FORWARDED_PORTS, PFWD_SERVICE,
    PROTOCOL_MAJOR, PROTOCOL_MINOR, TCPIP_FORWARD,
};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;

/// Cookie sent with every locally originated keepalive request
const KEEPALIVE_COOKIE: u32 = 255;

/// Window ceiling advertised when confirming a channel
const MAX_WINDOW: u32 = u32::MAX;

/// Handshake progress. Advances monotonically; `Failed` is terminal and
/// reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Initial,
    ProtocolVersionSent,
    AuthServiceRequestSent,
    AuthRequestSent,
    PfwdServiceRequestSent,
    GlobalRequestSent,
    Established,
    Failed,
}

/// Inputs the driver feeds the engine besides raw transport bytes
#[derive(Debug)]
pub enum Event {
    /// The keepalive timer fired.
    KeepaliveTick,
    /// The local dial for an accepted channel finished.
    LocalConnected { channel: ChannelId, ok: bool },
    /// Bytes were read from a channel's local connection.
    LocalData { channel: ChannelId, data: Bytes },
    /// A relayed payload was fully written to the local connection.
    LocalWritten { channel: ChannelId, len: u32 },
    /// The local connection ended or errored.
    LocalClosed { channel: ChannelId },
}

/// Outputs the driver applies to the real transport and relays
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Write one frame to the transport.
    Send(Message),
    /// Open a local connection for an accepted channel.
    DialLocal { channel: ChannelId, port: u16 },
    /// Forward a relayed payload to the channel's local connection.
    WriteLocal { channel: ChannelId, data: Bytes },
    /// Drop the channel's local connection and relay tasks.
    CloseLocal { channel: ChannelId },
    /// (Re)arm the keepalive timer, canceling any existing one.
    StartKeepalive { interval: Duration },
    /// Cancel the keepalive timer.
    StopKeepalive,
    /// The session has failed; tear the transport down.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelPhase {
    /// Local dial in flight, confirmation not yet sent
    Opening { window_size: u32 },
    Open,
}

/// The session state machine
pub struct Engine {
    state: SessionState,
    username: String,
    password: String,
    client_name: String,
    client_guid: [u8; 16],
    keepalive_interval: Duration,
    /// Cursor into [`FORWARDED_PORTS`]; counts registrations already asked for
    pfwd_cursor: usize,
    /// Open and opening channels, keyed by the peer-assigned sender id
    channels: HashMap<ChannelId, ChannelPhase>,
}

impl Engine {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            state: SessionState::Initial,
            username: config.username.clone(),
            password: config.password.clone(),
            client_name: config.client_name.clone(),
            client_guid: config.client_uuid.to_bytes_le(),
            keepalive_interval: config.keepalive_interval,
            pfwd_cursor: 0,
            channels: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether `channel` is fully open (confirmed, relay running)
    pub fn is_open(&self, channel: ChannelId) -> bool {
        matches!(self.channels.get(&channel), Some(ChannelPhase::Open))
    }

    /// First frames once the transport is secure: announce the protocol
    /// version and ask for the authentication service.
    pub fn start(&mut self) -> Vec<Action> {
        info!("tunnel secured; starting handshake");
        self.state = SessionState::ProtocolVersionSent;
        let version = Message::ProtocolVersion {
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
            reserved: 0,
            guid: self.client_guid,
        };
        self.state = SessionState::AuthServiceRequestSent;
        vec![
            Action::Send(version),
            Action::Send(Message::ServiceRequest {
                service: AUTH_SERVICE.to_owned(),
            }),
        ]
    }

    /// Drain every complete frame out of `buf`, advancing past consumed
    /// bytes. A trailing partial frame stays buffered for the next read.
    pub fn handle_bytes(&mut self, buf: &mut BytesMut) -> Vec<Action> {
        let mut actions = Vec::new();
        while self.state != SessionState::Failed {
            match codec::decode(&buf[..]) {
                Ok(Some((msg, consumed))) => {
                    buf.advance(consumed);
                    self.on_message(msg, &mut actions);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "undecodable frame from server");
                    self.fail(&mut actions);
                }
            }
        }
        actions
    }

    /// Apply one relay or timer event.
    pub fn handle_event(&mut self, event: Event) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == SessionState::Failed {
            return actions;
        }
        match event {
            Event::KeepaliveTick => {
                actions.push(Action::Send(Message::KeepaliveRequest {
                    cookie: KEEPALIVE_COOKIE,
                }));
            }
            Event::LocalConnected { channel, ok } => {
                self.on_local_connected(channel, ok, &mut actions)
            }
            Event::LocalData { channel, data } => {
                if self.is_open(channel) {
                    actions.push(Action::Send(Message::ChannelData { channel, data }));
                }
            }
            Event::LocalWritten { channel, len } => {
                // capacity is always granted back in full
                if self.is_open(channel) {
                    actions.push(Action::Send(Message::ChannelWindowAdjust {
                        channel,
                        bytes_to_add: len,
                    }));
                }
            }
            Event::LocalClosed { channel } => {
                if self.channels.remove(&channel).is_some() {
                    debug!(channel, "local connection ended; closing channel");
                    actions.push(Action::Send(Message::ChannelClose { channel }));
                    actions.push(Action::CloseLocal { channel });
                }
            }
        }
        actions
    }

    /// The transport closed or errored under us.
    pub fn connection_closed(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != SessionState::Failed {
            self.state = SessionState::Failed;
        }
        actions.push(Action::StopKeepalive);
        let ids: Vec<ChannelId> = self.channels.drain().map(|(id, _)| id).collect();
        for channel in ids {
            actions.push(Action::CloseLocal { channel });
        }
        actions
    }

    fn fail(&mut self, actions: &mut Vec<Action>) {
        self.state = SessionState::Failed;
        actions.push(Action::StopKeepalive);
        let ids: Vec<ChannelId> = self.channels.drain().map(|(id, _)| id).collect();
        for channel in ids {
            actions.push(Action::CloseLocal { channel });
        }
        actions.push(Action::Fail);
    }

    fn on_message(&mut self, msg: Message, actions: &mut Vec<Action>) {
        match msg {
            Message::ServiceAccept { service } => self.on_service_accept(&service, actions),
            Message::UserauthSuccess => {
                info!("authentication accepted");
                self.state = SessionState::PfwdServiceRequestSent;
                actions.push(Action::Send(Message::ServiceRequest {
                    service: PFWD_SERVICE.to_owned(),
                }));
            }
            Message::UserauthFailure => {
                warn!("authentication rejected by server");
                self.fail(actions);
            }
            Message::RequestSuccess { port } => self.on_request_success(port, actions),
            Message::KeepaliveRequest { cookie } => {
                debug!(cookie, "keepalive request");
                actions.push(Action::Send(Message::KeepaliveReply { cookie }));
            }
            Message::KeepaliveReply { cookie } => {
                debug!(cookie, "keepalive reply");
            }
            Message::KeepaliveOptionsRequest { interval, timeout } => {
                self.on_keepalive_options(interval, timeout, actions);
            }
            Message::ChannelOpen {
                sender_channel,
                window_size,
                target_port,
                ..
            } => self.on_channel_open(sender_channel, window_size, target_port, actions),
            Message::ChannelData { channel, data } => {
                if self.channels.contains_key(&channel) {
                    actions.push(Action::WriteLocal { channel, data });
                } else {
                    debug!(channel, "data for unknown channel dropped");
                }
            }
            Message::ChannelClose { channel } => {
                // idempotent: closing an unknown channel is a no-op
                if self.channels.remove(&channel).is_some() {
                    debug!(channel, "server closed channel");
                    actions.push(Action::Send(Message::ChannelClose { channel }));
                    actions.push(Action::CloseLocal { channel });
                }
            }
            Message::ChannelOpenConfirmation { .. } | Message::ChannelWindowAdjust { .. } => {
                // informational for a client that never opens channels
            }
            other => {
                warn!(wire_type = other.wire_type(), "unexpected frame for client role");
                self.fail(actions);
            }
        }
    }

    fn on_service_accept(&mut self, service: &str, actions: &mut Vec<Action>) {
        debug!(service, "service request accepted");
        if service == AUTH_SERVICE && self.state >= SessionState::AuthServiceRequestSent {
            self.state = SessionState::AuthRequestSent;
            actions.push(Action::Send(Message::UserauthRequest {
                username: self.username.clone(),
                service: PFWD_SERVICE.to_owned(),
                password: self.password.clone(),
            }));
        } else if service == PFWD_SERVICE && self.state >= SessionState::PfwdServiceRequestSent {
            self.send_next_forward_request(actions);
        }
    }

    fn send_next_forward_request(&mut self, actions: &mut Vec<Action>) {
        let port = FORWARDED_PORTS[self.pfwd_cursor];
        self.pfwd_cursor += 1;
        self.state = SessionState::GlobalRequestSent;
        actions.push(Action::Send(Message::GlobalRequest {
            request: TCPIP_FORWARD.to_owned(),
            want_reply: true,
            address: self.client_name.clone(),
            port: u32::from(port),
        }));
    }

    fn on_request_success(&mut self, port: Option<u32>, actions: &mut Vec<Action>) {
        if self.state != SessionState::GlobalRequestSent {
            debug!(?port, "request success outside forward registration");
            return;
        }
        debug!(?port, "forward registered");
        if self.pfwd_cursor < FORWARDED_PORTS.len() {
            self.send_next_forward_request(actions);
        } else {
            info!("all forwards registered; starting keepalive");
            self.state = SessionState::Established;
            actions.push(Action::StartKeepalive {
                interval: self.keepalive_interval,
            });
        }
    }

    fn on_keepalive_options(&mut self, interval: u32, timeout: u32, actions: &mut Vec<Action>) {
        if interval > 0 {
            let new_interval = Duration::from_secs(u64::from(interval));
            info!(interval, timeout, "server adjusted keepalive");
            self.keepalive_interval = new_interval;
            actions.push(Action::StartKeepalive {
                interval: new_interval,
            });
        } else {
            // a zero period would wedge the ticker; keep the current one
            warn!("ignoring keepalive options with zero interval");
        }
        actions.push(Action::Send(Message::KeepaliveOptionsReply { interval, timeout }));
    }

    fn on_channel_open(
        &mut self,
        sender_channel: ChannelId,
        window_size: u32,
        target_port: u32,
        actions: &mut Vec<Action>,
    ) {
        if !FORWARDED_PORTS
            .iter()
            .any(|port| u32::from(*port) == target_port)
        {
            warn!(
                channel = sender_channel,
                port = target_port,
                "rejecting channel to unforwarded port"
            );
            actions.push(Action::Send(Message::ChannelOpenFailure {
                recipient_channel: sender_channel,
                reason: open_failure_reason::UNKNOWN_CHANNEL_TYPE,
            }));
            return;
        }
        if self.channels.contains_key(&sender_channel) {
            warn!(
                channel = sender_channel,
                "rejecting duplicate open for a live channel"
            );
            actions.push(Action::Send(Message::ChannelOpenFailure {
                recipient_channel: sender_channel,
                reason: open_failure_reason::ADMINISTRATIVELY_PROHIBITED,
            }));
            return;
        }

        debug!(channel = sender_channel, port = target_port, "accepting channel");
        self.channels
            .insert(sender_channel, ChannelPhase::Opening { window_size });
        actions.push(Action::DialLocal {
            channel: sender_channel,
            port: target_port as u16,
        });
    }

    fn on_local_connected(&mut self, channel: ChannelId, ok: bool, actions: &mut Vec<Action>) {
        match self.channels.get(&channel) {
            Some(ChannelPhase::Opening { window_size }) => {
                let window_size = *window_size;
                if ok {
                    self.channels.insert(channel, ChannelPhase::Open);
                    actions.push(Action::Send(Message::ChannelOpenConfirmation {
                        recipient_channel: channel,
                        sender_channel: channel,
                        window_size,
                        max_packet_size: MAX_WINDOW,
                    }));
                } else {
                    self.channels.remove(&channel);
                    actions.push(Action::Send(Message::ChannelOpenFailure {
                        recipient_channel: channel,
                        reason: open_failure_reason::CONNECT_FAILED,
                    }));
                }
            }
            // the channel went away while the dial was in flight
            _ => {
                if ok {
                    actions.push(Action::CloseLocal { channel });
                }
            }
        }
    }
}
