//! Line-level control protocol spoken over the framed channel.
//!
//! The server pushes plain human-readable text most of the time; actionable
//! commands are marked with a `:>` sentinel and split on `;`. Lines that look
//! like commands but do not parse fall back to plain text rather than killing
//! the session, matching how the server mixes banners and directives on the
//! same channel.

pub const COMMAND_SENTINEL: &str = ":>";
pub const HEARTBEAT_LINE: &str = "PING";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Which relay engines this client is willing to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub tcp: bool,
    pub udp: bool,
}

impl Capabilities {
    pub fn flags(&self) -> &'static str {
        match (self.tcp, self.udp) {
            (true, true) => "TU",
            (true, false) => "T",
            (false, true) => "U",
            (false, false) => "",
        }
    }
}

/// First line the client sends after the control socket opens:
/// `<locale>;<version>;<access key>;<capability flags>`.
pub fn handshake_line(locale: &str, access_key: &str, caps: Capabilities) -> String {
    format!("{locale};{CLIENT_VERSION};{access_key};{}", caps.flags())
}

/// Data-channel self-identification, sent as the first line on a freshly
/// dialed relay connection so the server can pair it with the pending request.
pub fn identify_tcp(id: &str) -> String {
    format!("TCP;{id}")
}

pub fn identify_udp(id: &str) -> String {
    format!("UDP;{id}")
}

/// A directive pushed by the server on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    /// The public port the server bound for this tunnel.
    AssignedPort(u16),
    /// Dial a new TCP data channel and relay for `peer`.
    OpenTcp { id: String, peer: String },
    /// Dial a new UDP-over-TCP data channel and relay for `peer`.
    OpenUdp { id: String, peer: String },
    /// Session terminated server-side for inactivity.
    ExitNoFlow,
    /// Remaining-quota notice, surfaced to the operator verbatim.
    QuotaWarning(String),
    /// Anything else; logged as-is.
    Plain(String),
}

pub fn parse_server_line(line: &str) -> ServerCommand {
    let trimmed = line.trim();

    let body = trimmed.strip_prefix(COMMAND_SENTINEL).unwrap_or(trimmed);
    let body = body.trim();

    if is_quota_warning(body) {
        return ServerCommand::QuotaWarning(body.to_string());
    }

    if body == "exitNoFlow" {
        return ServerCommand::ExitNoFlow;
    }

    if let Ok(port) = body.parse::<u16>() {
        return ServerCommand::AssignedPort(port);
    }

    let mut parts = body.split(';');
    match parts.next() {
        Some("sendSocketTCP") => {
            if let (Some(id), Some(peer)) = (parts.next(), parts.next()) {
                if !id.is_empty() {
                    return ServerCommand::OpenTcp {
                        id: id.to_string(),
                        peer: peer.to_string(),
                    };
                }
            }
        }
        Some("sendSocketUDP") => {
            if let (Some(id), Some(peer)) = (parts.next(), parts.next()) {
                if !id.is_empty() {
                    return ServerCommand::OpenUdp {
                        id: id.to_string(),
                        peer: peer.to_string(),
                    };
                }
            }
        }
        _ => {}
    }

    ServerCommand::Plain(line.to_string())
}

fn is_quota_warning(line: &str) -> bool {
    const MARKERS: &[&str] = &["This access code have", "消耗", "使用链接"];
    MARKERS.iter().any(|m| line.contains(m))
}

/// Outcome of the server's response to the handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    /// Client version refused; `latest` is the newest version the server
    /// advertised, when it did.
    Outdated { latest: Option<String>, raw: String },
    /// Access denied; the session must not be retried.
    Rejected(String),
    /// Accepted; the raw line is a greeting worth logging.
    Ok(String),
}

pub fn classify_handshake_reply(line: &str) -> HandshakeReply {
    const OUTDATED: &[&str] = &["nsupported", "不", "旧"];
    const FATAL: &[&str] = &["exit", "退", "错误", "denied", "already", "过期", "占"];

    if OUTDATED.iter().any(|m| line.contains(m)) {
        return HandshakeReply::Outdated {
            latest: extract_latest_version(line),
            raw: line.to_string(),
        };
    }
    if FATAL.iter().any(|m| line.contains(m)) {
        return HandshakeReply::Rejected(line.to_string());
    }
    HandshakeReply::Ok(line.to_string())
}

// The rejection line ends with a version list, e.g.
// "Unsupported version: old|1.2|1.3"; the newest is the last element.
fn extract_latest_version(line: &str) -> Option<String> {
    let (_, tail) = line.split_once(':')?;
    let last = tail.rsplit('|').next()?.trim();
    if last.is_empty() {
        None
    } else {
        Some(last.to_string())
    }
}

/// Locale tag sent in the handshake; the server localizes its notices.
pub fn detect_locale() -> &'static str {
    let lang = std::env::var("LC_ALL")
        .or_else(|_| std::env::var("LANG"))
        .unwrap_or_default();
    if lang.starts_with("zh") { "zh" } else { "en" }
}
