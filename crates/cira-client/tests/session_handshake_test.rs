//! Full session against a scripted management server
//!
//! Spins a real TLS listener with a self-signed certificate, walks the
//! client through the complete handshake, registers all six forwards, then
//! exercises the keepalive options exchange.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use cira_client::{ClientConfig, Session};
use cira_proto::{codec, Message, AUTH_SERVICE, FORWARDED_PORTS, PFWD_SERVICE, TCPIP_FORWARD};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

const CLIENT_UUID: &str = "c7f70ef1-ba1d-4e24-a60c-5f0b84a2f417";

fn tls_acceptor() -> TlsAcceptor {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

async fn read_frame(stream: &mut TlsStream<TcpStream>, buf: &mut BytesMut) -> Message {
    loop {
        if let Some((msg, consumed)) = codec::decode(&buf[..]).unwrap() {
            buf.advance(consumed);
            return msg;
        }
        let n = stream.read_buf(buf).await.unwrap();
        assert!(n > 0, "client closed the tunnel mid-script");
    }
}

async fn send_frame(stream: &mut TlsStream<TcpStream>, msg: &Message) {
    stream.write_all(&codec::encode(msg)).await.unwrap();
    stream.flush().await.unwrap();
}

#[tokio::test]
async fn handshake_registers_forwards_and_adopts_keepalive_options() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let acceptor = tls_acceptor();
        let (tcp, _) = listener.accept().await.unwrap();
        let mut stream = acceptor.accept(tcp).await.unwrap();
        let mut buf = BytesMut::new();

        // protocol announcement carries the device GUID in wire order
        match read_frame(&mut stream, &mut buf).await {
            Message::ProtocolVersion {
                major,
                minor,
                guid,
                ..
            } => {
                assert_eq!((major, minor), (1, 0));
                let expected = uuid::Uuid::parse_str(CLIENT_UUID).unwrap().to_bytes_le();
                assert_eq!(guid, expected);
            }
            other => panic!("expected protocol version, got {other:?}"),
        }

        assert_eq!(
            read_frame(&mut stream, &mut buf).await,
            Message::ServiceRequest {
                service: AUTH_SERVICE.into()
            }
        );
        send_frame(
            &mut stream,
            &Message::ServiceAccept {
                service: AUTH_SERVICE.into(),
            },
        )
        .await;

        assert_eq!(
            read_frame(&mut stream, &mut buf).await,
            Message::UserauthRequest {
                username: "admin".into(),
                service: PFWD_SERVICE.into(),
                password: "secret".into(),
            }
        );
        send_frame(&mut stream, &Message::UserauthSuccess).await;

        assert_eq!(
            read_frame(&mut stream, &mut buf).await,
            Message::ServiceRequest {
                service: PFWD_SERVICE.into()
            }
        );
        send_frame(
            &mut stream,
            &Message::ServiceAccept {
                service: PFWD_SERVICE.into(),
            },
        )
        .await;

        // exactly one registration per port, in the fixed order
        for port in FORWARDED_PORTS {
            assert_eq!(
                read_frame(&mut stream, &mut buf).await,
                Message::GlobalRequest {
                    request: TCPIP_FORWARD.into(),
                    want_reply: true,
                    address: "endpoint-1".into(),
                    port: u32::from(port),
                }
            );
            send_frame(
                &mut stream,
                &Message::RequestSuccess {
                    port: Some(u32::from(port)),
                },
            )
            .await;
        }

        // shrink the keepalive to one second and expect the echo
        send_frame(
            &mut stream,
            &Message::KeepaliveOptionsRequest {
                interval: 1,
                timeout: 5,
            },
        )
        .await;
        assert_eq!(
            read_frame(&mut stream, &mut buf).await,
            Message::KeepaliveOptionsReply {
                interval: 1,
                timeout: 5,
            }
        );

        // the rescheduled timer must produce a ping with the fixed cookie
        assert_eq!(
            read_frame(&mut stream, &mut buf).await,
            Message::KeepaliveRequest { cookie: 255 }
        );
        send_frame(&mut stream, &Message::KeepaliveReply { cookie: 255 }).await;
    });

    let config = ClientConfig::builder()
        .mps(addr.ip().to_string(), addr.port())
        .credentials("admin", "secret")
        .client_name("endpoint-1")
        .client_uuid(CLIENT_UUID)
        .device_address("127.0.0.1")
        // long enough that only the adopted options interval can fire
        .keepalive_interval(Duration::from_secs(600))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let mut session = Session::new(config);
    session.connect().await;

    tokio::time::timeout(Duration::from_secs(20), server)
        .await
        .expect("scripted server timed out")
        .unwrap();

    session.disconnect().await;
}

#[tokio::test]
async fn disconnect_without_connect_is_a_no_op() {
    let config = ClientConfig::builder()
        .mps("127.0.0.1", 4433)
        .credentials("admin", "secret")
        .client_name("endpoint-1")
        .client_uuid(CLIENT_UUID)
        .device_address("127.0.0.1")
        .build()
        .unwrap();

    let mut session = Session::new(config);
    session.disconnect().await;
    session.disconnect().await;
}

#[tokio::test]
async fn refused_connection_ends_the_session_task() {
    // bind then drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ClientConfig::builder()
        .mps(addr.ip().to_string(), addr.port())
        .credentials("admin", "secret")
        .client_name("endpoint-1")
        .client_uuid(CLIENT_UUID)
        .device_address("127.0.0.1")
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let mut session = Session::new(config);
    session.connect().await;
    // the failure is logged and the task ends; disconnect stays clean
    tokio::time::sleep(Duration::from_millis(500)).await;
    session.disconnect().await;
}
