//! APF frame codec
//!
//! APF frames carry no outer length field: the leading byte selects the
//! message type and the decoder consumes the lengths that type declares.
//! `decode` is resumable — a frame whose declared lengths run past the
//! buffered bytes yields `Ok(None)`, the buffer is left untouched, and the
//! caller retries once more bytes arrive. On success the number of bytes
//! consumed is returned so the caller can advance its receive cursor.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::messages::{msg_type, Message, PASSWORD_METHOD};

/// Zero padding trailing the PROTOCOL_VERSION frame
const VERSION_PAD: usize = 64;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("{0} field is not valid UTF-8")]
    InvalidString(&'static str),

    #[error("unsupported authentication method: {0:?}")]
    UnsupportedAuthMethod(String),
}

/// Encode one message into a wire frame.
pub fn encode(msg: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(msg.wire_type());

    match msg {
        Message::ProtocolVersion {
            major,
            minor,
            reserved,
            guid,
        } => {
            buf.put_u32(*major);
            buf.put_u32(*minor);
            buf.put_u32(*reserved);
            buf.put_slice(guid);
            buf.put_bytes(0, VERSION_PAD);
        }
        Message::ServiceRequest { service } | Message::ServiceAccept { service } => {
            put_string(&mut buf, service);
        }
        Message::UserauthRequest {
            username,
            service,
            password,
        } => {
            put_string(&mut buf, username);
            put_string(&mut buf, service);
            put_string(&mut buf, PASSWORD_METHOD);
            buf.put_u8(0);
            put_string(&mut buf, password);
        }
        Message::UserauthFailure | Message::UserauthSuccess => {}
        Message::GlobalRequest {
            request,
            want_reply,
            address,
            port,
        } => {
            put_string(&mut buf, request);
            buf.put_u8(u8::from(*want_reply));
            put_string(&mut buf, address);
            buf.put_u32(*port);
        }
        Message::RequestSuccess { port } => {
            if let Some(port) = port {
                buf.put_u32(*port);
            }
        }
        Message::ChannelOpen {
            channel_type,
            sender_channel,
            window_size,
            max_packet_size,
            target_address,
            target_port,
            origin_address,
            origin_port,
        } => {
            put_string(&mut buf, channel_type);
            buf.put_u32(*sender_channel);
            buf.put_u32(*window_size);
            buf.put_u32(*max_packet_size);
            put_string(&mut buf, target_address);
            buf.put_u32(*target_port);
            put_string(&mut buf, origin_address);
            buf.put_u32(*origin_port);
        }
        Message::ChannelOpenConfirmation {
            recipient_channel,
            sender_channel,
            window_size,
            max_packet_size,
        } => {
            buf.put_u32(*recipient_channel);
            buf.put_u32(*sender_channel);
            buf.put_u32(*window_size);
            buf.put_u32(*max_packet_size);
        }
        Message::ChannelOpenFailure {
            recipient_channel,
            reason,
        } => {
            buf.put_u32(*recipient_channel);
            buf.put_u32(*reason);
            buf.put_u32(0);
            buf.put_u32(0);
        }
        Message::ChannelWindowAdjust {
            channel,
            bytes_to_add,
        } => {
            buf.put_u32(*channel);
            buf.put_u32(*bytes_to_add);
        }
        Message::ChannelData { channel, data } => {
            buf.put_u32(*channel);
            buf.put_u32(data.len() as u32);
            buf.put_slice(data);
        }
        Message::ChannelClose { channel } => {
            buf.put_u32(*channel);
        }
        Message::KeepaliveRequest { cookie } | Message::KeepaliveReply { cookie } => {
            buf.put_u32(*cookie);
        }
        Message::KeepaliveOptionsRequest { interval, timeout }
        | Message::KeepaliveOptionsReply { interval, timeout } => {
            buf.put_u32(*interval);
            buf.put_u32(*timeout);
        }
    }

    buf.freeze()
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Decode one message from the front of `buf`.
///
/// Returns the message and the number of bytes it occupied, `Ok(None)` when
/// the buffer does not yet hold a complete frame, or an error for traffic
/// that can never become valid.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, CodecError> {
    let mut r = Reader::new(buf);
    let Some(tag) = r.take_u8() else {
        return Ok(None);
    };

    let msg = match tag {
        msg_type::PROTOCOL_VERSION => {
            let Some(major) = r.take_u32() else {
                return Ok(None);
            };
            let Some(minor) = r.take_u32() else {
                return Ok(None);
            };
            let Some(reserved) = r.take_u32() else {
                return Ok(None);
            };
            let Some(raw) = r.take_bytes(16) else {
                return Ok(None);
            };
            let mut guid = [0u8; 16];
            guid.copy_from_slice(raw);
            if r.take_bytes(VERSION_PAD).is_none() {
                return Ok(None);
            }
            Message::ProtocolVersion {
                major,
                minor,
                reserved,
                guid,
            }
        }
        msg_type::SERVICE_REQUEST => {
            let Some(service) = r.take_string("service name")? else {
                return Ok(None);
            };
            Message::ServiceRequest { service }
        }
        msg_type::SERVICE_ACCEPT => {
            let Some(service) = r.take_string("service name")? else {
                return Ok(None);
            };
            Message::ServiceAccept { service }
        }
        msg_type::USERAUTH_REQUEST => {
            let Some(username) = r.take_string("username")? else {
                return Ok(None);
            };
            let Some(service) = r.take_string("service name")? else {
                return Ok(None);
            };
            let Some(method) = r.take_string("auth method")? else {
                return Ok(None);
            };
            if method != PASSWORD_METHOD {
                return Err(CodecError::UnsupportedAuthMethod(method));
            }
            if r.take_u8().is_none() {
                return Ok(None);
            }
            let Some(password) = r.take_string("password")? else {
                return Ok(None);
            };
            Message::UserauthRequest {
                username,
                service,
                password,
            }
        }
        msg_type::USERAUTH_FAILURE => Message::UserauthFailure,
        msg_type::USERAUTH_SUCCESS => Message::UserauthSuccess,
        msg_type::GLOBAL_REQUEST => {
            let Some(request) = r.take_string("request name")? else {
                return Ok(None);
            };
            let Some(want_reply) = r.take_u8() else {
                return Ok(None);
            };
            let Some(address) = r.take_string("address")? else {
                return Ok(None);
            };
            let Some(port) = r.take_u32() else {
                return Ok(None);
            };
            Message::GlobalRequest {
                request,
                want_reply: want_reply != 0,
                address,
                port,
            }
        }
        // The bound port is optional on the wire; when fewer than four
        // bytes follow the tag the frame is just the tag.
        msg_type::REQUEST_SUCCESS => Message::RequestSuccess { port: r.take_u32() },
        msg_type::CHANNEL_OPEN => {
            let Some(channel_type) = r.take_string("channel type")? else {
                return Ok(None);
            };
            let Some(sender_channel) = r.take_u32() else {
                return Ok(None);
            };
            let Some(window_size) = r.take_u32() else {
                return Ok(None);
            };
            let Some(max_packet_size) = r.take_u32() else {
                return Ok(None);
            };
            let Some(target_address) = r.take_string("target address")? else {
                return Ok(None);
            };
            let Some(target_port) = r.take_u32() else {
                return Ok(None);
            };
            let Some(origin_address) = r.take_string("origin address")? else {
                return Ok(None);
            };
            let Some(origin_port) = r.take_u32() else {
                return Ok(None);
            };
            Message::ChannelOpen {
                channel_type,
                sender_channel,
                window_size,
                max_packet_size,
                target_address,
                target_port,
                origin_address,
                origin_port,
            }
        }
        msg_type::CHANNEL_OPEN_CONFIRMATION => {
            let Some(recipient_channel) = r.take_u32() else {
                return Ok(None);
            };
            let Some(sender_channel) = r.take_u32() else {
                return Ok(None);
            };
            let Some(window_size) = r.take_u32() else {
                return Ok(None);
            };
            let Some(max_packet_size) = r.take_u32() else {
                return Ok(None);
            };
            Message::ChannelOpenConfirmation {
                recipient_channel,
                sender_channel,
                window_size,
                max_packet_size,
            }
        }
        msg_type::CHANNEL_OPEN_FAILURE => {
            let Some(recipient_channel) = r.take_u32() else {
                return Ok(None);
            };
            let Some(reason) = r.take_u32() else {
                return Ok(None);
            };
            // two reserved words
            if r.take_u32().is_none() || r.take_u32().is_none() {
                return Ok(None);
            }
            Message::ChannelOpenFailure {
                recipient_channel,
                reason,
            }
        }
        msg_type::CHANNEL_WINDOW_ADJUST => {
            let Some(channel) = r.take_u32() else {
                return Ok(None);
            };
            let Some(bytes_to_add) = r.take_u32() else {
                return Ok(None);
            };
            Message::ChannelWindowAdjust {
                channel,
                bytes_to_add,
            }
        }
        msg_type::CHANNEL_DATA => {
            let Some(channel) = r.take_u32() else {
                return Ok(None);
            };
            let Some(len) = r.take_u32() else {
                return Ok(None);
            };
            let Some(data) = r.take_bytes(len as usize) else {
                return Ok(None);
            };
            Message::ChannelData {
                channel,
                data: Bytes::copy_from_slice(data),
            }
        }
        msg_type::CHANNEL_CLOSE => {
            let Some(channel) = r.take_u32() else {
                return Ok(None);
            };
            Message::ChannelClose { channel }
        }
        msg_type::KEEPALIVE_REQUEST => {
            let Some(cookie) = r.take_u32() else {
                return Ok(None);
            };
            Message::KeepaliveRequest { cookie }
        }
        msg_type::KEEPALIVE_REPLY => {
            let Some(cookie) = r.take_u32() else {
                return Ok(None);
            };
            Message::KeepaliveReply { cookie }
        }
        msg_type::KEEPALIVE_OPTIONS_REQUEST => {
            let Some(interval) = r.take_u32() else {
                return Ok(None);
            };
            let Some(timeout) = r.take_u32() else {
                return Ok(None);
            };
            Message::KeepaliveOptionsRequest { interval, timeout }
        }
        msg_type::KEEPALIVE_OPTIONS_REPLY => {
            let Some(interval) = r.take_u32() else {
                return Ok(None);
            };
            let Some(timeout) = r.take_u32() else {
                return Ok(None);
            };
            Message::KeepaliveOptionsReply { interval, timeout }
        }
        other => return Err(CodecError::UnknownMessageType(other)),
    };

    Ok(Some((msg, r.consumed())))
}

/// Cursor over a borrowed buffer. Every `take_*` either consumes what it
/// asked for or consumes nothing, so a short read leaves the position where
/// a retry can resume.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn consumed(&self) -> usize {
        self.pos
    }

    fn take_u8(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn take_u32(&mut self) -> Option<u32> {
        let bytes = self.take_bytes(4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    /// Length-prefixed string. `Ok(None)` when the buffer is short; an
    /// error when the bytes are there but are not UTF-8.
    fn take_string(&mut self, field: &'static str) -> Result<Option<String>, CodecError> {
        let start = self.pos;
        let Some(len) = self.take_u32() else {
            return Ok(None);
        };
        let Some(raw) = self.take_bytes(len as usize) else {
            self.pos = start;
            return Ok(None);
        };
        match std::str::from_utf8(raw) {
            Ok(s) => Ok(Some(s.to_owned())),
            Err(_) => Err(CodecError::InvalidString(field)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::open_failure_reason;

    fn roundtrip(msg: Message) {
        let wire = encode(&msg);
        let (decoded, consumed) = decode(&wire).expect("decode failed").expect("incomplete");
        assert_eq!(decoded, msg);
        assert_eq!(consumed, wire.len());
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::ProtocolVersion {
                major: 1,
                minor: 0,
                reserved: 0,
                guid: [7u8; 16],
            },
            Message::ServiceRequest {
                service: "auth@amt.intel.com".into(),
            },
            Message::ServiceAccept {
                service: "pfwd@amt.intel.com".into(),
            },
            Message::UserauthRequest {
                username: "admin".into(),
                service: "pfwd@amt.intel.com".into(),
                password: "P@ssw0rd".into(),
            },
            Message::UserauthFailure,
            Message::UserauthSuccess,
            Message::GlobalRequest {
                request: "tcpip-forward".into(),
                want_reply: true,
                address: "endpoint-1".into(),
                port: 16992,
            },
            Message::RequestSuccess { port: Some(16992) },
            Message::RequestSuccess { port: None },
            Message::ChannelOpen {
                channel_type: "forwarded-tcpip".into(),
                sender_channel: 5,
                window_size: 4096,
                max_packet_size: 0xffff,
                target_address: "endpoint-1".into(),
                target_port: 16992,
                origin_address: "10.0.0.9".into(),
                origin_port: 51234,
            },
            Message::ChannelOpenConfirmation {
                recipient_channel: 5,
                sender_channel: 5,
                window_size: 4096,
                max_packet_size: u32::MAX,
            },
            Message::ChannelOpenFailure {
                recipient_channel: 5,
                reason: open_failure_reason::UNKNOWN_CHANNEL_TYPE,
            },
            Message::ChannelWindowAdjust {
                channel: 5,
                bytes_to_add: 1024,
            },
            Message::ChannelData {
                channel: 5,
                data: Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"),
            },
            Message::ChannelClose { channel: 5 },
            Message::KeepaliveRequest { cookie: 255 },
            Message::KeepaliveReply { cookie: 255 },
            Message::KeepaliveOptionsRequest {
                interval: 30,
                timeout: 60,
            },
            Message::KeepaliveOptionsReply {
                interval: 30,
                timeout: 60,
            },
        ]
    }

    #[test]
    fn roundtrip_every_message_type() {
        for msg in sample_messages() {
            roundtrip(msg);
        }
    }

    #[test]
    fn truncated_frames_ask_for_more_data() {
        for msg in sample_messages() {
            let wire = encode(&msg);
            // REQUEST_SUCCESS is genuinely ambiguous when truncated: its
            // port field is optional, so a bare tag already decodes.
            if matches!(msg, Message::RequestSuccess { .. }) {
                continue;
            }
            for cut in 1..wire.len() {
                let result = decode(&wire[..cut]).expect("truncation must not be an error");
                assert!(
                    result.is_none(),
                    "cut at {cut} of {:?} decoded to {result:?}",
                    msg
                );
            }
        }
    }

    #[test]
    fn empty_buffer_needs_more_data() {
        assert!(decode(&[]).unwrap().is_none());
    }

    #[test]
    fn unknown_type_is_an_error() {
        let err = decode(&[7, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::UnknownMessageType(7)));
    }

    #[test]
    fn non_password_auth_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(msg_type::USERAUTH_REQUEST);
        put_string(&mut buf, "admin");
        put_string(&mut buf, "pfwd@amt.intel.com");
        put_string(&mut buf, "publickey");
        buf.put_u8(0);
        put_string(&mut buf, "");
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedAuthMethod(_)));
    }

    #[test]
    fn channel_open_wire_layout() {
        // hand-built frame: type "fwd", sender 2, window 512, max 4096,
        // target "a" port 16992, origin "b" port 9
        let mut wire = vec![msg_type::CHANNEL_OPEN];
        wire.extend_from_slice(&3u32.to_be_bytes());
        wire.extend_from_slice(b"fwd");
        wire.extend_from_slice(&2u32.to_be_bytes());
        wire.extend_from_slice(&512u32.to_be_bytes());
        wire.extend_from_slice(&4096u32.to_be_bytes());
        wire.extend_from_slice(&1u32.to_be_bytes());
        wire.extend_from_slice(b"a");
        wire.extend_from_slice(&16992u32.to_be_bytes());
        wire.extend_from_slice(&1u32.to_be_bytes());
        wire.extend_from_slice(b"b");
        wire.extend_from_slice(&9u32.to_be_bytes());

        let (msg, consumed) = decode(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(
            msg,
            Message::ChannelOpen {
                channel_type: "fwd".into(),
                sender_channel: 2,
                window_size: 512,
                max_packet_size: 4096,
                target_address: "a".into(),
                target_port: 16992,
                origin_address: "b".into(),
                origin_port: 9,
            }
        );
        assert_eq!(encode(&msg), Bytes::from(wire));
    }

    #[test]
    fn protocol_version_frame_is_93_bytes() {
        let wire = encode(&Message::ProtocolVersion {
            major: 1,
            minor: 0,
            reserved: 0,
            guid: [0u8; 16],
        });
        assert_eq!(wire.len(), 93);
        assert_eq!(wire[0], msg_type::PROTOCOL_VERSION);
    }

    #[test]
    fn back_to_back_frames_decode_in_sequence() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode(&Message::KeepaliveRequest { cookie: 1 }));
        wire.extend_from_slice(&encode(&Message::ChannelClose { channel: 9 }));

        let (first, n) = decode(&wire).unwrap().unwrap();
        assert_eq!(first, Message::KeepaliveRequest { cookie: 1 });
        let (second, m) = decode(&wire[n..]).unwrap().unwrap();
        assert_eq!(second, Message::ChannelClose { channel: 9 });
        assert_eq!(n + m, wire.len());
    }
}
