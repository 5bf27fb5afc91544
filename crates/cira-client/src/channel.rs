//! Local channel relays
//!
//! Each accepted channel owns one local connection to the managed device,
//! plain TCP or TLS-wrapped against the service's TLS sibling on port + 1.
//! A reader task turns local bytes into relay events; a writer task applies
//! relayed payloads and reports completed writes so the session can grant
//! window capacity back.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use cira_proto::ChannelId;
use cira_transport::tls;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tracing::debug;

/// Read buffer for the local connection
const READ_CHUNK: usize = 16 * 1024;

/// Events relay tasks feed back into the session loop
#[derive(Debug)]
pub(crate) enum RelayEvent {
    Connected {
        channel: ChannelId,
        stream: io::Result<LocalStream>,
    },
    Data {
        channel: ChannelId,
        data: Bytes,
    },
    Written {
        channel: ChannelId,
        len: u32,
    },
    Closed {
        channel: ChannelId,
    },
}

/// A channel's local connection, plain or TLS-wrapped
#[derive(Debug)]
pub(crate) enum LocalStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for LocalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            LocalStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LocalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            LocalStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            LocalStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            LocalStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            LocalStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dial the device service behind an accepted channel. With TLS upgrade the
/// TLS sibling of the service listens one port up and presents a
/// certificate we do not verify, matching how the device exposes it.
pub(crate) async fn dial(
    host: &str,
    port: u16,
    tls_upgrade: bool,
    timeout: Duration,
) -> io::Result<LocalStream> {
    let dialed = tokio::time::timeout(timeout, async {
        if tls_upgrade {
            let tcp = TcpStream::connect((host, port + 1)).await?;
            let connector = tls::connector(false);
            let name = tls::server_name(host)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
            let stream = connector.connect(name, tcp).await?;
            Ok(LocalStream::Tls(Box::new(stream)))
        } else {
            Ok(LocalStream::Plain(TcpStream::connect((host, port)).await?))
        }
    })
    .await;

    match dialed {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "local connect timed out",
        )),
    }
}

/// A registered channel: the local connection's relay tasks and the queue
/// feeding its write side.
pub(crate) struct ChannelHandle {
    /// Unbounded on purpose: window capacity is always granted back in
    /// full, so the transport side is never asked to slow down.
    data_tx: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ChannelHandle {
    pub(crate) fn spawn(
        channel: ChannelId,
        stream: LocalStream,
        events: mpsc::Sender<RelayEvent>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(channel, read_half, events.clone()));
        let writer = tokio::spawn(write_loop(channel, write_half, data_rx, events));
        Self {
            data_tx,
            reader,
            writer,
        }
    }

    /// Queue a relayed payload for the local connection.
    pub(crate) fn write(&self, data: Bytes) {
        // a dead writer already reported Closed; the payload is moot
        let _ = self.data_tx.send(data);
    }

    pub(crate) fn shutdown(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop(
    channel: ChannelId,
    mut read_half: ReadHalf<LocalStream>,
    events: mpsc::Sender<RelayEvent>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let data = buf.split().freeze();
                if events.send(RelayEvent::Data { channel, data }).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!(channel, %err, "local read failed");
                break;
            }
        }
    }
    let _ = events.send(RelayEvent::Closed { channel }).await;
}

async fn write_loop(
    channel: ChannelId,
    mut write_half: WriteHalf<LocalStream>,
    mut data_rx: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::Sender<RelayEvent>,
) {
    while let Some(data) = data_rx.recv().await {
        let len = data.len() as u32;
        if let Err(err) = write_half.write_all(&data).await {
            debug!(channel, %err, "local write failed");
            let _ = events.send(RelayEvent::Closed { channel }).await;
            return;
        }
        if events
            .send(RelayEvent::Written { channel, len })
            .await
            .is_err()
        {
            return;
        }
    }
    // the session dropped this channel; nothing left to report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn relay_round_trip_over_plain_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let stream = dial(
            &addr.ip().to_string(),
            addr.port(),
            false,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let handle = ChannelHandle::spawn(3, stream, events_tx);

        handle.write(Bytes::from_static(b"ping"));

        // write completion first, then the echoed bytes, then EOF
        let mut saw_written = false;
        let mut saw_data = false;
        while let Some(event) = events_rx.recv().await {
            match event {
                RelayEvent::Written { channel: 3, len: 4 } => saw_written = true,
                RelayEvent::Data { channel: 3, data } => {
                    assert_eq!(&data[..], b"ping");
                    saw_data = true;
                }
                RelayEvent::Closed { channel: 3 } => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_written);
        assert!(saw_data);

        handle.shutdown();
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn dial_refused_port_errors() {
        // bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = dial(
            &addr.ip().to_string(),
            addr.port(),
            false,
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_err());
    }
}
