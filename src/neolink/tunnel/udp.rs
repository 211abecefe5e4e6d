use std::sync::Arc;

use tokio::{net::UdpSocket, time::timeout};
use tracing::{debug, info, warn};

use crate::neolink::{
    config::Config,
    protocol,
    proxy::Dialer,
    transport::{FrameReader, FrameWriter},
    tunnel::{datagram, relay::RelayError},
};

/// Largest datagram we expect from the local service. Matches the envelope
/// payload ceiling so every received packet can be encoded.
const MAX_DATAGRAM: usize = 65_536;

/// Serves one `sendSocketUDP` directive: opens a TCP data channel to the
/// server and a local UDP socket, then translates between envelope blocks on
/// the stream and raw datagrams toward the local service.
pub async fn run_udp_relay(
    cfg: Arc<Config>,
    server_dialer: Arc<Dialer>,
    id: String,
    peer: String,
) -> Result<(), RelayError> {
    let relay = timeout(
        cfg.dial_timeout,
        server_dialer.dial(&cfg.server_addr, cfg.data_port),
    )
    .await
    .map_err(|_| RelayError::DialTimeout(cfg.dial_timeout))??;

    let (rr, rw) = relay.into_split();
    let mut relay_writer = FrameWriter::new(rw);
    relay_writer.send_line(&protocol::identify_udp(&id)).await?;
    let relay_reader = FrameReader::new(rr);

    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);

    info!(id = %id, peer = %peer, "relay: udp bridge up");
    let result = bridge(
        cfg,
        socket,
        relay_reader,
        relay_writer,
    )
    .await;
    match &result {
        Ok(()) => debug!(id = %id, peer = %peer, "relay: udp bridge down"),
        Err(err) => warn!(id = %id, peer = %peer, error = %err, "relay: udp bridge failed"),
    }
    result
}

async fn bridge<R, W>(
    cfg: Arc<Config>,
    socket: Arc<UdpSocket>,
    mut relay_reader: FrameReader<R>,
    mut relay_writer: FrameWriter<W>,
) -> Result<(), RelayError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let up_socket = socket.clone();
    let up = async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = up_socket.recv_from(&mut buf).await?;
            match datagram::encode(from, &buf[..n]) {
                Ok(wire) => relay_writer.send_block(Some(&wire)).await?,
                Err(err) => {
                    debug!(error = %err, "relay: dropping unencodable datagram");
                }
            }
        }
        // recv_from never returns Ok(0)-style EOF; the loop only ends on error.
        #[allow(unreachable_code)]
        Ok::<(), RelayError>(())
    };

    let down_socket = socket;
    let down = async move {
        loop {
            let Some(block) = relay_reader.receive_block().await? else {
                return Ok::<(), RelayError>(());
            };
            match datagram::decode(&block) {
                Ok(env) => {
                    // Replies always go to the configured local service; the
                    // envelope's source address is informational only.
                    down_socket
                        .send_to(&env.payload, (cfg.local_domain.as_str(), cfg.local_port))
                        .await?;
                }
                Err(err) => {
                    debug!(error = %err, "relay: dropping malformed envelope");
                }
            }
        }
    };

    // The bridge lives until the relay channel errors or the session aborts
    // the task. Either copy direction ending tears down the whole bridge.
    tokio::select! {
        r = up => r,
        r = down => r,
    }
}
