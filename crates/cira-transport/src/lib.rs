//! Tunnel transport establishment
//!
//! Produces the single TLS-protected byte stream a session runs over:
//! direct, or through an HTTP CONNECT / SOCKS5 proxy. Proxy negotiation and
//! the TLS handshake run under one caller-supplied timeout; the protocol
//! itself defines none.

pub mod proxy;
pub mod tls;

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

pub use proxy::{ProxyConfig, ProxyError, ProxyKind};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    #[error("proxy negotiation failed: {0}")]
    Proxy(#[from] ProxyError),

    #[error("timed out connecting to {0}")]
    Timeout(String),
}

/// How to reach the management server
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub proxy: Option<ProxyConfig>,
    pub verify_server_cert: bool,
    pub timeout: Duration,
}

/// The session's transport: one TLS stream, tagged by how it was dialed.
#[derive(Debug)]
pub enum TransportStream {
    Direct(TlsStream<TcpStream>),
    HttpProxy(TlsStream<TcpStream>),
    Socks5Proxy(TlsStream<TcpStream>),
}

impl TransportStream {
    /// Human-readable route tag for logs
    pub fn via(&self) -> &'static str {
        match self {
            TransportStream::Direct(_) => "direct",
            TransportStream::HttpProxy(_) => "http-proxy",
            TransportStream::Socks5Proxy(_) => "socks5-proxy",
        }
    }

    fn inner_mut(&mut self) -> &mut TlsStream<TcpStream> {
        match self {
            TransportStream::Direct(stream)
            | TransportStream::HttpProxy(stream)
            | TransportStream::Socks5Proxy(stream) => stream,
        }
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(self.get_mut().inner_mut()).poll_read(cx, buf)
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(self.get_mut().inner_mut()).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.get_mut().inner_mut()).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.get_mut().inner_mut()).poll_shutdown(cx)
    }
}

/// Establish the transport described by `opts`.
///
/// Any proxy failure closes the raw socket before TLS is attempted; the
/// timeout covers the TCP dial, proxy negotiation, and the TLS handshake
/// together.
pub async fn connect(opts: &ConnectOptions) -> Result<TransportStream, TransportError> {
    tokio::time::timeout(opts.timeout, establish(opts))
        .await
        .map_err(|_| TransportError::Timeout(format!("{}:{}", opts.host, opts.port)))?
}

async fn establish(opts: &ConnectOptions) -> Result<TransportStream, TransportError> {
    match &opts.proxy {
        None => {
            let tcp = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
            let tls = handshake(tcp, opts).await?;
            Ok(TransportStream::Direct(tls))
        }
        Some(proxy) => {
            debug!(
                proxy_host = %proxy.host,
                proxy_port = proxy.port,
                kind = ?proxy.kind,
                "negotiating proxy tunnel"
            );
            let mut tcp = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
            match proxy.kind {
                ProxyKind::Http => {
                    proxy::http_connect(&mut tcp, &opts.host, opts.port).await?;
                    let tls = handshake(tcp, opts).await?;
                    Ok(TransportStream::HttpProxy(tls))
                }
                ProxyKind::Socks5 => {
                    proxy::socks5_connect(&mut tcp, &opts.host, opts.port).await?;
                    let tls = handshake(tcp, opts).await?;
                    Ok(TransportStream::Socks5Proxy(tls))
                }
            }
        }
    }
}

async fn handshake(
    tcp: TcpStream,
    opts: &ConnectOptions,
) -> Result<TlsStream<TcpStream>, TransportError> {
    let connector = tls::connector(opts.verify_server_cert);
    let name = tls::server_name(&opts.host)
        .map_err(|_| TransportError::InvalidServerName(opts.host.clone()))?;
    Ok(connector.connect(name, tcp).await?)
}
