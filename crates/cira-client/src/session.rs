//! Session lifecycle and driver loop
//!
//! A [`Session`] owns at most one transport at a time. `connect` spawns the
//! driver task: establish the (possibly proxied) TLS tunnel, run the
//! handshake through the engine, then loop over transport reads, relay
//! events, and keepalive ticks. Every transport write happens on this one
//! task, which keeps the frame stream serialized no matter how many relays
//! are active.

use std::collections::HashMap;

use bytes::BytesMut;
use cira_proto::{codec, ChannelId};
use cira_transport::{self as transport, ConnectOptions, TransportError, TransportStream};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{dial, ChannelHandle, RelayEvent};
use crate::config::ClientConfig;
use crate::engine::{Action, Engine, Event};
use crate::keepalive::KeepaliveTimer;

/// Receive buffer grown as server frames arrive
const RECV_BUF: usize = 16 * 1024;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("transport read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("transport write failed: {0}")]
    Write(#[source] std::io::Error),
}

/// One tunnel to one management server on behalf of one device.
pub struct Session {
    config: ClientConfig,
    runtime: Option<Runtime>,
}

struct Runtime {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl Session {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            runtime: None,
        }
    }

    /// Begin the asynchronous handshake. An existing connection is disposed
    /// of first. Failures are surfaced through logging; the session task
    /// simply ends.
    pub async fn connect(&mut self) {
        self.disconnect().await;

        let (shutdown, shutdown_rx) = mpsc::channel(1);
        let config = self.config.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = run(config, shutdown_rx).await {
                error!(%err, "session ended with error");
            }
        });
        self.runtime = Some(Runtime { shutdown, task });
    }

    /// Tear down the transport, every open relay, and the keepalive timer.
    pub async fn disconnect(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = runtime.shutdown.send(()).await;
            if let Err(err) = runtime.task.await {
                debug!(%err, "session task did not exit cleanly");
            }
        }
    }
}

/// Everything the action applier touches. The transport's write half lives
/// here and nowhere else.
struct SessionIo {
    writer: WriteHalf<TransportStream>,
    channels: HashMap<ChannelId, ChannelHandle>,
    events_tx: mpsc::Sender<RelayEvent>,
    device_address: String,
    tls_upgrade: bool,
    connect_timeout: std::time::Duration,
}

async fn run(config: ClientConfig, mut shutdown: mpsc::Receiver<()>) -> Result<(), SessionError> {
    let options = ConnectOptions {
        host: config.mps_host.clone(),
        port: config.mps_port,
        proxy: config.proxy.clone(),
        verify_server_cert: config.verify_server_cert,
        timeout: config.connect_timeout,
    };

    let stream = tokio::select! {
        _ = shutdown.recv() => return Ok(()),
        result = transport::connect(&options) => result?,
    };
    info!(
        host = %config.mps_host,
        port = config.mps_port,
        via = stream.via(),
        "tunnel established"
    );

    let (mut reader, writer) = tokio::io::split(stream);
    let (events_tx, mut events_rx) = mpsc::channel::<RelayEvent>(256);
    let mut io = SessionIo {
        writer,
        channels: HashMap::new(),
        events_tx,
        device_address: config.device_address.clone(),
        tls_upgrade: config.tls_upgrade,
        connect_timeout: config.connect_timeout,
    };
    let mut engine = Engine::new(&config);
    let mut keepalive = KeepaliveTimer::stopped();
    let mut acc = BytesMut::with_capacity(RECV_BUF);

    let startup = engine.start();
    let mut alive = apply(startup, &mut io, &mut keepalive).await?;

    let result = loop {
        if !alive {
            break Ok(());
        }
        tokio::select! {
            _ = shutdown.recv() => {
                info!("disconnect requested");
                break Ok(());
            }
            read = reader.read_buf(&mut acc) => match read {
                Ok(0) => {
                    info!("server closed the tunnel");
                    let actions = engine.connection_closed();
                    let _ = apply(actions, &mut io, &mut keepalive).await;
                    break Ok(());
                }
                Ok(_) => {
                    let actions = engine.handle_bytes(&mut acc);
                    alive = apply(actions, &mut io, &mut keepalive).await?;
                }
                Err(err) => {
                    let actions = engine.connection_closed();
                    let _ = apply(actions, &mut io, &mut keepalive).await;
                    break Err(SessionError::Read(err));
                }
            },
            event = events_rx.recv() => {
                // the session holds a sender, so recv never returns None
                if let Some(event) = event {
                    let actions = on_relay_event(&mut engine, &mut io, event);
                    alive = apply(actions, &mut io, &mut keepalive).await?;
                }
            }
            _ = keepalive.tick() => {
                let actions = engine.handle_event(Event::KeepaliveTick);
                alive = apply(actions, &mut io, &mut keepalive).await?;
            }
        }
    };

    for (_, handle) in io.channels.drain() {
        handle.shutdown();
    }
    let _ = io.writer.shutdown().await;
    result
}

/// Translate a relay event into engine input, registering the relay tasks
/// for a local connection the engine accepts.
fn on_relay_event(engine: &mut Engine, io: &mut SessionIo, event: RelayEvent) -> Vec<Action> {
    match event {
        RelayEvent::Connected { channel, stream } => match stream {
            Ok(stream) => {
                let actions = engine.handle_event(Event::LocalConnected { channel, ok: true });
                if engine.is_open(channel) {
                    let handle = ChannelHandle::spawn(channel, stream, io.events_tx.clone());
                    io.channels.insert(channel, handle);
                }
                actions
            }
            Err(err) => {
                debug!(channel, %err, "local connect failed");
                engine.handle_event(Event::LocalConnected { channel, ok: false })
            }
        },
        RelayEvent::Data { channel, data } => {
            engine.handle_event(Event::LocalData { channel, data })
        }
        RelayEvent::Written { channel, len } => {
            engine.handle_event(Event::LocalWritten { channel, len })
        }
        RelayEvent::Closed { channel } => engine.handle_event(Event::LocalClosed { channel }),
    }
}

/// Apply engine actions. Returns `Ok(false)` when the engine asked for the
/// session to end.
async fn apply(
    actions: Vec<Action>,
    io: &mut SessionIo,
    keepalive: &mut KeepaliveTimer,
) -> Result<bool, SessionError> {
    let mut alive = true;
    let mut wrote = false;

    for action in actions {
        match action {
            Action::Send(msg) => {
                let frame = codec::encode(&msg);
                io.writer
                    .write_all(&frame)
                    .await
                    .map_err(SessionError::Write)?;
                wrote = true;
            }
            Action::DialLocal { channel, port } => {
                let events = io.events_tx.clone();
                let host = io.device_address.clone();
                let tls_upgrade = io.tls_upgrade;
                let timeout = io.connect_timeout;
                tokio::spawn(async move {
                    let stream = dial(&host, port, tls_upgrade, timeout).await;
                    let _ = events.send(RelayEvent::Connected { channel, stream }).await;
                });
            }
            Action::WriteLocal { channel, data } => {
                if let Some(handle) = io.channels.get(&channel) {
                    handle.write(data);
                }
            }
            Action::CloseLocal { channel } => {
                if let Some(handle) = io.channels.remove(&channel) {
                    handle.shutdown();
                }
            }
            Action::StartKeepalive { interval } => keepalive.restart(interval),
            Action::StopKeepalive => keepalive.stop(),
            Action::Fail => {
                warn!("session failed; closing transport");
                alive = false;
            }
        }
    }

    if wrote {
        io.writer.flush().await.map_err(SessionError::Write)?;
    }
    Ok(alive)
}
