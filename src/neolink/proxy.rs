use std::io;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// How to reach a target through a forward proxy.
///
/// Parsed from the descriptor `"<kind>-><host>:<port>[@<user>;<password>]"`;
/// `kind` is `socks` or `http`, anything else degrades to a direct connect
/// (the proxy endpoint is then ignored). An empty descriptor means "no proxy".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Direct,
    Socks,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("bad proxy descriptor: {0}")]
    BadDescriptor(String),
    #[error("proxy handshake failed: {0}")]
    Handshake(String),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl ProxySpec {
    /// Parses a descriptor; `Ok(None)` means connect directly.
    pub fn parse(descriptor: &str) -> Result<Option<ProxySpec>, ProxyError> {
        let descriptor = descriptor.trim();
        if descriptor.is_empty() {
            return Ok(None);
        }

        let (kind_s, rest) = descriptor
            .split_once("->")
            .ok_or_else(|| ProxyError::BadDescriptor(descriptor.to_string()))?;

        let kind = match kind_s.trim() {
            "socks" => ProxyKind::Socks,
            "http" => ProxyKind::Http,
            _ => ProxyKind::Direct,
        };

        let (endpoint, creds) = match rest.split_once('@') {
            Some((ep, creds)) => (ep, Some(creds)),
            None => (rest, None),
        };

        let (host, port_s) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::BadDescriptor(descriptor.to_string()))?;
        let port: u16 = port_s
            .trim()
            .parse()
            .map_err(|_| ProxyError::BadDescriptor(descriptor.to_string()))?;

        let (username, password) = match creds {
            None => (None, None),
            Some(c) => {
                let (u, p) = c
                    .split_once(';')
                    .ok_or_else(|| ProxyError::BadDescriptor(descriptor.to_string()))?;
                (Some(u.to_string()), Some(p.to_string()))
            }
        };

        Ok(Some(ProxySpec {
            kind,
            host: host.trim().to_string(),
            port,
            username,
            password,
        }))
    }
}

/// Connects to targets either directly or through one configured forward
/// proxy. Two independent instances exist at runtime: one toward the relay
/// server, one toward the local service.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    spec: Option<ProxySpec>,
}

impl Dialer {
    pub fn new(spec: Option<ProxySpec>) -> Self {
        Self { spec }
    }

    pub fn from_descriptor(descriptor: &str) -> Result<Self, ProxyError> {
        Ok(Self::new(ProxySpec::parse(descriptor)?))
    }

    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        match &self.spec {
            None => Ok(TcpStream::connect((host, port)).await?),
            Some(spec) => match spec.kind {
                ProxyKind::Direct => Ok(TcpStream::connect((host, port)).await?),
                ProxyKind::Socks => self.dial_socks5(spec, host, port).await,
                ProxyKind::Http => self.dial_http_connect(spec, host, port).await,
            },
        }
    }

    async fn dial_socks5(
        &self,
        spec: &ProxySpec,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, ProxyError> {
        let mut stream = TcpStream::connect((spec.host.as_str(), spec.port)).await?;

        let want_auth = spec.username.is_some();
        if want_auth {
            stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await?;
        } else {
            stream.write_all(&[0x05, 0x01, 0x00]).await?;
        }

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != 0x05 {
            return Err(ProxyError::Handshake("not a SOCKS5 proxy".into()));
        }

        match reply[1] {
            0x00 => {}
            0x02 if want_auth => {
                // RFC 1929 username/password subnegotiation.
                let user = spec.username.as_deref().unwrap_or_default().as_bytes();
                let pass = spec.password.as_deref().unwrap_or_default().as_bytes();
                if user.len() > 255 || pass.len() > 255 {
                    return Err(ProxyError::Handshake("credentials too long".into()));
                }
                let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
                msg.push(0x01);
                msg.push(user.len() as u8);
                msg.extend_from_slice(user);
                msg.push(pass.len() as u8);
                msg.extend_from_slice(pass);
                stream.write_all(&msg).await?;

                let mut auth_reply = [0u8; 2];
                stream.read_exact(&mut auth_reply).await?;
                if auth_reply[1] != 0x00 {
                    return Err(ProxyError::Handshake("proxy rejected credentials".into()));
                }
            }
            other => {
                return Err(ProxyError::Handshake(format!(
                    "no acceptable auth method (offered {other:#04x})"
                )));
            }
        }

        // CONNECT with a domain-typed target; the proxy resolves the name.
        let host_bytes = host.as_bytes();
        if host_bytes.len() > 255 {
            return Err(ProxyError::Handshake("target host too long".into()));
        }
        let mut req = Vec::with_capacity(7 + host_bytes.len());
        req.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host_bytes.len() as u8]);
        req.extend_from_slice(host_bytes);
        req.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&req).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != 0x00 {
            return Err(ProxyError::Handshake(format!(
                "connect refused (rep {:#04x})",
                head[1]
            )));
        }
        // Drain the bound address so the stream starts at the payload.
        let addr_len = match head[3] {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                let mut l = [0u8; 1];
                stream.read_exact(&mut l).await?;
                l[0] as usize
            }
            other => {
                return Err(ProxyError::Handshake(format!(
                    "bad address type in reply ({other:#04x})"
                )));
            }
        };
        let mut bound = vec![0u8; addr_len + 2];
        stream.read_exact(&mut bound).await?;

        Ok(stream)
    }

    async fn dial_http_connect(
        &self,
        spec: &ProxySpec,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, ProxyError> {
        let mut stream = TcpStream::connect((spec.host.as_str(), spec.port)).await?;

        let mut req = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
        if let (Some(user), Some(pass)) = (&spec.username, &spec.password) {
            let token = BASE64.encode(format!("{user}:{pass}"));
            req.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        req.push_str("\r\n");
        stream.write_all(req.as_bytes()).await?;

        // Read until the end of the response head, bounded.
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() > 8 * 1024 {
                return Err(ProxyError::Handshake("oversized CONNECT response".into()));
            }
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(ProxyError::Handshake(
                    "proxy closed during CONNECT".into(),
                ));
            }
            head.push(byte[0]);
        }

        let status_line = head
            .split(|&b| b == b'\n')
            .next()
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .unwrap_or_default();
        let ok = status_line
            .split_whitespace()
            .nth(1)
            .is_some_and(|code| code.starts_with('2'));
        if !ok {
            return Err(ProxyError::Handshake(format!(
                "CONNECT failed: {}",
                status_line.trim()
            )));
        }

        Ok(stream)
    }
}
