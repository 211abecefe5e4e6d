use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::{Mutex, watch},
    time::{Instant, timeout},
};
use tracing::{debug, info, warn};

use crate::neolink::{
    config::Config,
    protocol::{self, Capabilities, HandshakeReply, ServerCommand},
    proxy::{Dialer, ProxyError},
    transport::{Channel, FrameError, FrameReader, FrameWriter},
    tunnel::{
        heartbeat::{HeartbeatMonitor, LastInbound},
        registry::RelayRegistry,
        relay, udp,
    },
    update::Updater,
};

/// Control latency above this is worth telling the operator about.
const SLOW_HANDSHAKE: Duration = Duration::from_millis(200);

/// Printed once at startup; reconnect runs skip it.
const LOGO: &str = r"
  _   _            _     _       _
 | \ | | ___  ___ | |   (_)_ __ | | __
 |  \| |/ _ \/ _ \| |   | | '_ \| |/ /
 | |\  |  __/ (_) | |___| | | | |   <
 |_| \_|\___|\___/|_____|_|_| |_|_|\_\
";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("server rejected the session: {0}")]
    Rejected(String),
    #[error("client version refused by server")]
    Outdated { latest: Option<String> },
    #[error("server ended the session for inactivity")]
    NoFlow,
    #[error("server closed the control channel")]
    ControlClosed,
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Fatal errors end the client outright; reconnecting cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Rejected(_) | SessionError::Outdated { .. } | SessionError::NoFlow
        )
    }
}

/// How a session that did not error came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Operator asked us to stop.
    Shutdown,
    /// Server closed the control channel.
    ServerClosed,
    /// Server dropped us for carrying no traffic.
    NoFlow,
}

/// One tunnel client: owns the control channel lifecycle, dispatches server
/// directives into relay tasks, and drives the reconnect policy.
pub struct Client {
    cfg: Arc<Config>,
    updater: Arc<dyn Updater>,
    server_dialer: Arc<Dialer>,
    local_dialer: Arc<Dialer>,
    registry: Arc<RelayRegistry>,
    // 0 means "not assigned"; valid ports are 1..=65535.
    assigned_port: AtomicU32,
}

impl Client {
    pub fn new(cfg: Arc<Config>, updater: Arc<dyn Updater>) -> Result<Self, ProxyError> {
        let server_dialer = Arc::new(Dialer::from_descriptor(&cfg.proxy_to_server)?);
        let local_dialer = Arc::new(Dialer::from_descriptor(&cfg.proxy_to_local)?);
        Ok(Self {
            cfg,
            updater,
            server_dialer,
            local_dialer,
            registry: Arc::new(RelayRegistry::new()),
            assigned_port: AtomicU32::new(0),
        })
    }

    /// The public port the server last assigned, if any.
    pub fn assigned_remote_port(&self) -> Option<u16> {
        match self.assigned_port.load(Ordering::SeqCst) {
            0 => None,
            p => Some(p as u16),
        }
    }

    /// Runs sessions until shutdown or until a failure the policy will not
    /// retry; such failures are returned so the process can exit non-zero.
    /// Recoverable ones trigger the reconnect countdown when enabled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        let mut first = true;
        loop {
            if first {
                for line in LOGO.lines().filter(|l| !l.trim().is_empty()) {
                    info!("{line}");
                }
                info!(
                    version = protocol::CLIENT_VERSION,
                    server = %self.cfg.server_addr,
                    control_port = self.cfg.control_port,
                    local = %format!("{}:{}", self.cfg.local_domain, self.cfg.local_port),
                    "session: starting tunnel client"
                );
                first = false;
            }

            let err = match self.run_once(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::NoFlow) => {
                    warn!("session: server ended the session for inactivity");
                    return Err(SessionError::NoFlow);
                }
                Ok(SessionEnd::ServerClosed) => SessionError::ControlClosed,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => err,
            };
            warn!(error = %err, "session: connection lost");

            if !self.cfg.reconnect.enabled {
                return Err(err);
            }

            let secs = self.cfg.reconnect.interval.as_secs().max(1) as u32;
            let completed = countdown_ticks(secs, &mut shutdown, |remaining| {
                info!(seconds = remaining, "session: reconnecting shortly");
            })
            .await;
            if !completed {
                return Ok(());
            }
        }
    }

    async fn run_once(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, SessionError> {
        let stream = timeout(
            self.cfg.dial_timeout,
            self.server_dialer
                .dial(&self.cfg.server_addr, self.cfg.control_port),
        )
        .await
        .map_err(|_| SessionError::DialTimeout(self.cfg.dial_timeout))??;

        let (mut reader, writer) = Channel::new(stream).into_split();
        let writer = Arc::new(Mutex::new(writer));

        self.handshake(&mut reader, &writer).await?;

        let last_inbound = LastInbound::now();
        let heartbeat = HeartbeatMonitor::spawn(
            writer.clone(),
            last_inbound.clone(),
            self.cfg.heartbeat_delay,
        );

        let end = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(SessionEnd::Shutdown);
                    }
                }
                line = reader.receive_line() => {
                    match line {
                        Err(err) => break Err(SessionError::from(err)),
                        Ok(None) => break Ok(SessionEnd::ServerClosed),
                        Ok(Some(line)) => {
                            last_inbound.touch();
                            if let Some(end) = self.dispatch(&line).await {
                                break Ok(end);
                            }
                        }
                    }
                }
            }
        };

        heartbeat.abort();
        self.registry.close_all().await;
        self.assigned_port.store(0, Ordering::SeqCst);
        end
    }

    async fn handshake(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &Arc<Mutex<FrameWriter<OwnedWriteHalf>>>,
    ) -> Result<(), SessionError> {
        let locale = if self.cfg.locale.is_empty() {
            protocol::detect_locale().to_string()
        } else {
            self.cfg.locale.clone()
        };
        let caps = Capabilities {
            tcp: self.cfg.tcp_enabled,
            udp: self.cfg.udp_enabled,
        };
        let line = protocol::handshake_line(&locale, &self.cfg.access_key, caps);

        let started = Instant::now();
        {
            let mut w = writer.lock().await;
            w.send_line(&line).await?;
        }
        let Some(reply) = reader.receive_line().await? else {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "server closed during handshake",
            )));
        };
        let latency = started.elapsed();

        match protocol::classify_handshake_reply(&reply) {
            HandshakeReply::Outdated { latest, raw } => {
                warn!(reply = %raw, "session: server refused this client version");
                let answer = if self.cfg.auto_update { "true" } else { "false" };
                let mut w = writer.lock().await;
                let _ = w.send_line(answer).await;
                if self.cfg.auto_update {
                    self.updater.begin_update(latest.as_deref());
                }
                Err(SessionError::Outdated { latest })
            }
            HandshakeReply::Rejected(raw) => Err(SessionError::Rejected(raw)),
            HandshakeReply::Ok(greeting) => {
                info!(greeting = %greeting, latency_ms = latency.as_millis() as u64, "session: handshake accepted");
                if latency > SLOW_HANDSHAKE {
                    warn!(
                        latency_ms = latency.as_millis() as u64,
                        "session: high control latency to server"
                    );
                }
                Ok(())
            }
        }
    }

    // Returns Some when the directive ends the session.
    async fn dispatch(&self, line: &str) -> Option<SessionEnd> {
        match protocol::parse_server_line(line) {
            ServerCommand::AssignedPort(port) => {
                self.assigned_port.store(port as u32, Ordering::SeqCst);
                info!(
                    port,
                    server = %self.cfg.server_addr,
                    "session: public endpoint assigned"
                );
            }
            ServerCommand::OpenTcp { id, peer } => {
                if !self.cfg.tcp_enabled {
                    debug!(id = %id, peer = %peer, "session: tcp relaying disabled, ignoring request");
                    return None;
                }
                let cfg = self.cfg.clone();
                let server_dialer = self.server_dialer.clone();
                let local_dialer = self.local_dialer.clone();
                self.registry
                    .spawn(async move {
                        let _ =
                            relay::run_tcp_relay(cfg, server_dialer, local_dialer, id, peer).await;
                    })
                    .await;
            }
            ServerCommand::OpenUdp { id, peer } => {
                if !self.cfg.udp_enabled {
                    debug!(id = %id, peer = %peer, "session: udp relaying disabled, ignoring request");
                    return None;
                }
                let cfg = self.cfg.clone();
                let server_dialer = self.server_dialer.clone();
                self.registry
                    .spawn(async move {
                        let _ = udp::run_udp_relay(cfg, server_dialer, id, peer).await;
                    })
                    .await;
            }
            ServerCommand::ExitNoFlow => return Some(SessionEnd::NoFlow),
            ServerCommand::QuotaWarning(msg) => {
                warn!(notice = %msg, "session: traffic quota notice");
            }
            ServerCommand::Plain(msg) => {
                info!(server_says = %msg, "session: notice");
            }
        }
        None
    }
}

/// Ticks once per second, newest remaining count first. Returns false when the
/// shutdown signal interrupted the wait.
pub async fn countdown_ticks<F>(
    total_secs: u32,
    shutdown: &mut watch::Receiver<bool>,
    mut on_tick: F,
) -> bool
where
    F: FnMut(u32),
{
    for remaining in (1..=total_secs).rev() {
        on_tick(remaining);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
    true
}
