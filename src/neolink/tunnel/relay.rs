use std::{pin::pin, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::neolink::{
    config::Config,
    protocol,
    proxy::{Dialer, ProxyError},
    transport::{FrameError, FrameReader, FrameWriter},
};

/// PROXY protocol v2 signature. The server may prepend one header to the
/// first data block of a relayed TCP connection.
const PPV2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Serves one `sendSocketTCP` directive: dials a fresh data channel to the
/// server and a fresh connection to the local service, then shuttles bytes
/// both ways until both directions finish or either fails.
pub async fn run_tcp_relay(
    cfg: Arc<Config>,
    server_dialer: Arc<Dialer>,
    local_dialer: Arc<Dialer>,
    id: String,
    peer: String,
) -> Result<(), RelayError> {
    // Local first: if the local service is down there is nothing to relay,
    // and the server never sees a data channel identified for this id.
    let local = timeout(
        cfg.dial_timeout,
        local_dialer.dial(&cfg.local_domain, cfg.local_port),
    )
    .await
    .map_err(|_| RelayError::DialTimeout(cfg.dial_timeout))??;

    let relay = timeout(
        cfg.dial_timeout,
        server_dialer.dial(&cfg.server_addr, cfg.data_port),
    )
    .await
    .map_err(|_| RelayError::DialTimeout(cfg.dial_timeout))??;

    let (rr, rw) = relay.into_split();
    let mut relay_writer = FrameWriter::new(rw);
    relay_writer.send_line(&protocol::identify_tcp(&id)).await?;

    info!(id = %id, peer = %peer, "relay: tcp bridge up");
    let result = pump(
        local,
        FrameReader::new(rr),
        relay_writer,
        cfg.buffer_size,
        cfg.proxy_protocol_passthrough,
    )
    .await;
    match &result {
        Ok(()) => debug!(id = %id, peer = %peer, "relay: tcp bridge down"),
        Err(err) => warn!(id = %id, peer = %peer, error = %err, "relay: tcp bridge failed"),
    }
    result
}

/// Bridges a raw local stream with a framed relay channel. Each direction is
/// allowed to finish independently; an error in either direction drops both.
pub async fn pump<L, R, W>(
    local: L,
    relay_reader: FrameReader<R>,
    relay_writer: FrameWriter<W>,
    buffer_size: usize,
    pp_passthrough: bool,
) -> Result<(), RelayError>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (local_reader, local_writer) = tokio::io::split(local);

    let mut up = pin!(copy_local_to_relay(local_reader, relay_writer, buffer_size));
    let mut down = pin!(copy_relay_to_local(
        relay_reader,
        local_writer,
        pp_passthrough
    ));

    let mut up_done = false;
    let mut down_done = false;
    while !(up_done && down_done) {
        tokio::select! {
            r = &mut up, if !up_done => {
                up_done = true;
                r?;
            }
            r = &mut down, if !down_done => {
                down_done = true;
                r?;
            }
        }
    }
    Ok(())
}

async fn copy_local_to_relay<R, W>(
    mut local: R,
    mut relay: FrameWriter<W>,
    buffer_size: usize,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = local.read(&mut buf).await?;
        if n == 0 {
            // Local service finished writing; tell the far side explicitly.
            relay.send_block(None).await?;
            return Ok(());
        }
        relay.send_block(Some(&buf[..n])).await?;
    }
}

async fn copy_relay_to_local<R, W>(
    mut relay: FrameReader<R>,
    mut local: W,
    pp_passthrough: bool,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut first_block = true;
    loop {
        let Some(block) = relay.receive_block().await? else {
            local.shutdown().await?;
            return Ok(());
        };
        if block.is_empty() {
            continue;
        }
        let block = if first_block {
            first_block = false;
            match strip_proxy_protocol(&block, pp_passthrough) {
                Some(b) => b,
                None => continue,
            }
        } else {
            block.to_vec()
        };
        local.write_all(&block).await?;
        local.flush().await?;
    }
}

// The header, when present, sits at the very start of the first block. With
// passthrough on it is forwarded untouched for the local service to consume;
// otherwise the header bytes are removed and only trailing payload survives.
fn strip_proxy_protocol(block: &[u8], passthrough: bool) -> Option<Vec<u8>> {
    if !block.starts_with(&PPV2_SIGNATURE) {
        return Some(block.to_vec());
    }
    if passthrough {
        return Some(block.to_vec());
    }
    if block.len() < 16 {
        return None;
    }
    let addr_len = u16::from_be_bytes([block[14], block[15]]) as usize;
    let header_len = 16 + addr_len;
    if block.len() <= header_len {
        return None;
    }
    Some(block[header_len..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neolink::config::{LoggingConfig, ReconnectConfig};
    use tokio::{io::duplex, net::TcpListener};

    fn ppv2_header(addr_len: u16) -> Vec<u8> {
        let mut h = PPV2_SIGNATURE.to_vec();
        h.push(0x21); // version 2, PROXY command
        h.push(0x11); // TCP over IPv4
        h.extend_from_slice(&addr_len.to_be_bytes());
        h.extend_from_slice(&vec![0u8; addr_len as usize]);
        h
    }

    fn test_config(data_port: u16, local_port: u16) -> Arc<Config> {
        Arc::new(Config {
            server_addr: "127.0.0.1".into(),
            control_port: 44801,
            data_port,
            access_key: "k".into(),
            local_domain: "127.0.0.1".into(),
            local_port,
            locale: "en".into(),
            tcp_enabled: true,
            udp_enabled: true,
            proxy_protocol_passthrough: false,
            buffer_size: 64 * 1024,
            dial_timeout: Duration::from_secs(5),
            heartbeat_delay: Duration::from_secs(1),
            reconnect: ReconnectConfig {
                enabled: false,
                interval: Duration::from_secs(30),
            },
            auto_update: false,
            proxy_to_server: String::new(),
            proxy_to_local: String::new(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "discard".into(),
                add_source: false,
            },
        })
    }

    #[tokio::test]
    async fn dead_local_service_never_dials_the_data_channel() {
        let data_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_port = data_ln.local_addr().unwrap().port();

        // Bind then drop to get a port that refuses connections.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let cfg = test_config(data_port, dead_port);
        let dialer = Arc::new(Dialer::default());
        let result = run_tcp_relay(
            cfg,
            dialer.clone(),
            dialer,
            "42".into(),
            "203.0.113.5:1".into(),
        )
        .await;
        assert!(result.is_err());

        let dialed = tokio::time::timeout(Duration::from_millis(300), data_ln.accept()).await;
        assert!(dialed.is_err(), "data channel must not be opened");
    }

    #[tokio::test]
    async fn bridges_both_directions() {
        let (local_ours, mut local_theirs) = duplex(1024);
        let (relay_ours, relay_theirs) = duplex(1024);

        let (rr, rw) = tokio::io::split(relay_ours);
        let bridge = tokio::spawn(pump(
            local_ours,
            FrameReader::new(rr),
            FrameWriter::new(rw),
            64 * 1024,
            false,
        ));

        let (fr_raw, fw_raw) = tokio::io::split(relay_theirs);
        let mut server_reader = FrameReader::new(fr_raw);
        let mut server_writer = FrameWriter::new(fw_raw);

        // Server pushes a request, local answers.
        server_writer.send_block(Some(b"GET / HTTP/1.0\r\n\r\n")).await.unwrap();
        let mut req = [0u8; 18];
        local_theirs.read_exact(&mut req).await.unwrap();
        assert_eq!(&req, b"GET / HTTP/1.0\r\n\r\n");

        local_theirs.write_all(b"hello").await.unwrap();
        let reply = server_reader.receive_block().await.unwrap().unwrap();
        assert_eq!(&reply[..], b"hello");

        // Tear down both directions.
        server_writer.send_block(None).await.unwrap();
        drop(local_theirs);

        bridge.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn local_eof_becomes_explicit_end_of_data() {
        let (local_ours, local_theirs) = duplex(1024);
        let (relay_ours, relay_theirs) = duplex(1024);

        let (rr, rw) = tokio::io::split(relay_ours);
        let bridge = tokio::spawn(pump(
            local_ours,
            FrameReader::new(rr),
            FrameWriter::new(rw),
            4096,
            false,
        ));

        drop(local_theirs);

        let (fr_raw, fw_raw) = tokio::io::split(relay_theirs);
        let mut server_reader = FrameReader::new(fr_raw);
        assert!(server_reader.receive_block().await.unwrap().is_none());

        let mut server_writer = FrameWriter::new(fw_raw);
        server_writer.send_block(None).await.unwrap();
        bridge.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn proxy_protocol_header_is_stripped_by_default() {
        let (local_ours, mut local_theirs) = duplex(1024);
        let (relay_ours, relay_theirs) = duplex(1024);

        let (rr, rw) = tokio::io::split(relay_ours);
        let _bridge = tokio::spawn(pump(
            local_ours,
            FrameReader::new(rr),
            FrameWriter::new(rw),
            4096,
            false,
        ));

        let (_fr_raw, fw_raw) = tokio::io::split(relay_theirs);
        let mut server_writer = FrameWriter::new(fw_raw);

        let mut first = ppv2_header(12);
        first.extend_from_slice(b"payload");
        server_writer.send_block(Some(&first)).await.unwrap();

        let mut got = [0u8; 7];
        local_theirs.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"payload");
    }

    #[tokio::test]
    async fn proxy_protocol_header_forwarded_with_passthrough() {
        let (local_ours, mut local_theirs) = duplex(1024);
        let (relay_ours, relay_theirs) = duplex(1024);

        let (rr, rw) = tokio::io::split(relay_ours);
        let _bridge = tokio::spawn(pump(
            local_ours,
            FrameReader::new(rr),
            FrameWriter::new(rw),
            4096,
            true,
        ));

        let (_fr_raw, fw_raw) = tokio::io::split(relay_theirs);
        let mut server_writer = FrameWriter::new(fw_raw);

        let header = ppv2_header(12);
        server_writer.send_block(Some(&header)).await.unwrap();

        let mut got = vec![0u8; header.len()];
        local_theirs.read_exact(&mut got).await.unwrap();
        assert_eq!(got, header);
    }

    #[tokio::test]
    async fn header_only_first_block_yields_no_local_bytes() {
        let (local_ours, mut local_theirs) = duplex(1024);
        let (relay_ours, relay_theirs) = duplex(1024);

        let (rr, rw) = tokio::io::split(relay_ours);
        let _bridge = tokio::spawn(pump(
            local_ours,
            FrameReader::new(rr),
            FrameWriter::new(rw),
            4096,
            false,
        ));

        let (_fr_raw, fw_raw) = tokio::io::split(relay_theirs);
        let mut server_writer = FrameWriter::new(fw_raw);
        server_writer.send_block(Some(&ppv2_header(12))).await.unwrap();
        server_writer.send_block(Some(b"later")).await.unwrap();

        let mut got = [0u8; 5];
        local_theirs.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"later");
    }
}
