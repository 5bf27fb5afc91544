//! Proxy tunnel negotiation
//!
//! Turns a raw TCP socket into a tunnel ready for TLS, either with an HTTP
//! CONNECT exchange or a SOCKS5 handshake. Only the no-auth SOCKS method is
//! offered; a server selecting anything else is fatal.

use std::net::Ipv4Addr;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Largest CONNECT response we are willing to buffer
const MAX_HTTP_RESPONSE: usize = 8 * 1024;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_NO_AUTH: u8 = 0x00;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;

/// Proxy flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks5,
}

/// Proxy endpoint configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
}

/// Proxy negotiation errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy returned unexpected status: {0:?}")]
    HttpStatus(String),

    #[error("proxy response exceeded {0} bytes without completing")]
    HttpResponseTooLarge(usize),

    #[error("proxy speaks SOCKS version {0}, expected 5")]
    SocksVersion(u8),

    #[error("proxy requires an authentication method we do not offer ({0:#04x})")]
    SocksAuthRequired(u8),

    #[error("proxy rejected the connect request (reply code {0})")]
    SocksRejected(u8),

    #[error("proxy sent unrecognized address type {0}")]
    SocksAddressType(u8),

    #[error("target hostname exceeds the 255-byte SOCKS limit")]
    HostnameTooLong,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Issue an HTTP CONNECT for `target_host:target_port` and wait for the 200.
pub async fn http_connect(
    stream: &mut TcpStream,
    target_host: &str,
    target_port: u16,
) -> Result<(), ProxyError> {
    let request = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\n\
         Host: {target_host}\r\n\
         Proxy-Connection: Keep-Alive\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    // Read up to the blank line ending the response headers.
    let mut response = Vec::new();
    loop {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::HttpStatus("connection closed".to_owned()));
        }
        response.extend_from_slice(&chunk[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if response.len() > MAX_HTTP_RESPONSE {
            return Err(ProxyError::HttpResponseTooLarge(MAX_HTTP_RESPONSE));
        }
    }

    let status_line = response
        .split(|&b| b == b'\r')
        .next()
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .unwrap_or_default();
    if !status_line.starts_with("HTTP/1.1 200") {
        return Err(ProxyError::HttpStatus(status_line));
    }

    debug!(target_host, target_port, "HTTP proxy tunnel established");
    Ok(())
}

/// Run the SOCKS5 greeting and connect exchange for `target_host:target_port`.
pub async fn socks5_connect(
    stream: &mut TcpStream,
    target_host: &str,
    target_port: u16,
) -> Result<(), ProxyError> {
    // Greeting: offer only the no-auth method.
    stream
        .write_all(&[SOCKS_VERSION, 1, SOCKS_NO_AUTH])
        .await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(ProxyError::SocksVersion(choice[0]));
    }
    if choice[1] != SOCKS_NO_AUTH {
        return Err(ProxyError::SocksAuthRequired(choice[1]));
    }

    // Connect request: version, connect, reserved, address, port.
    let mut request = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00];
    match target_host.parse::<Ipv4Addr>() {
        Ok(ip) => {
            request.push(SOCKS_ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = target_host.as_bytes();
            if name.len() > u8::MAX as usize {
                return Err(ProxyError::HostnameTooLong);
            }
            request.push(SOCKS_ATYP_DOMAIN);
            request.push(name.len() as u8);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await?;

    // Reply: version, code, reserved, bound address, bound port.
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::SocksVersion(head[0]));
    }
    if head[1] != 0x00 {
        return Err(ProxyError::SocksRejected(head[1]));
    }
    let bound_len = match head[3] {
        SOCKS_ATYP_IPV4 => 4,
        SOCKS_ATYP_IPV6 => 16,
        SOCKS_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(ProxyError::SocksAddressType(other)),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    debug!(target_host, target_port, "SOCKS5 proxy tunnel established");
    Ok(())
}
