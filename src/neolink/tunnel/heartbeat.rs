use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::{
    io::AsyncWrite,
    sync::Mutex,
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, warn};

use crate::neolink::{protocol, transport::FrameWriter};

/// Inbound traffic already proves the link is alive, so pings are suppressed
/// until the channel has been quiet for this long.
pub const QUIET_THRESHOLD: Duration = Duration::from_secs(2);

/// Shared "when did we last hear from the server" stamp, touched by the
/// control read loop and consulted by the heartbeat task.
#[derive(Debug, Clone)]
pub struct LastInbound(Arc<StdMutex<Instant>>);

impl LastInbound {
    pub fn now() -> Self {
        Self(Arc::new(StdMutex::new(Instant::now())))
    }

    pub fn touch(&self) {
        *self.0.lock().unwrap() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.0.lock().unwrap().elapsed()
    }
}

pub struct HeartbeatMonitor {
    handle: JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Pings the server over the shared control writer every `delay`, skipping
    /// ticks while inbound traffic is recent. A failed send tears the writer
    /// down and ends the task; the control read loop then observes the close.
    pub fn spawn<W>(
        writer: Arc<Mutex<FrameWriter<W>>>,
        last_inbound: LastInbound,
        delay: Duration,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                if last_inbound.elapsed() <= QUIET_THRESHOLD {
                    continue;
                }
                let mut w = writer.lock().await;
                if let Err(err) = w.send_line(protocol::HEARTBEAT_LINE).await {
                    warn!(error = %err, "heartbeat: send failed, closing control channel");
                    let _ = w.shutdown().await;
                    return;
                }
                debug!("heartbeat: ping");
            }
        });
        Self { handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neolink::transport::FrameReader;

    #[tokio::test(start_paused = true)]
    async fn pings_only_after_quiet_period() {
        let (a, b) = tokio::io::duplex(1024);
        let writer = Arc::new(Mutex::new(FrameWriter::new(a)));
        let mut reader = FrameReader::new(b);

        let last = LastInbound::now();
        let _hb = HeartbeatMonitor::spawn(writer, last.clone(), Duration::from_secs(1));

        // The first two ticks fall inside the quiet threshold.
        tokio::time::advance(Duration::from_millis(1500)).await;
        tokio::task::yield_now().await;

        // Third tick is past the threshold and must ping.
        tokio::time::advance(Duration::from_millis(1600)).await;
        assert_eq!(
            reader.receive_line().await.unwrap().as_deref(),
            Some(protocol::HEARTBEAT_LINE)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_suppresses_pings() {
        let (a, b) = tokio::io::duplex(1024);
        let writer = Arc::new(Mutex::new(FrameWriter::new(a)));
        let mut reader = FrameReader::new(b);

        let last = LastInbound::now();
        // Keep a writer handle alive past the abort so the reader observes
        // silence (timeout) rather than an abort-induced EOF.
        let _writer_keepalive = writer.clone();
        let hb = HeartbeatMonitor::spawn(writer, last.clone(), Duration::from_secs(1));

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
            last.touch();
        }

        hb.abort();
        // Nothing was ever quiet long enough to ping.
        let read = tokio::time::timeout(Duration::from_millis(10), reader.receive_line());
        assert!(read.await.is_err());
    }
}
