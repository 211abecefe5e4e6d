use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps NEOLINK_CONFIG into the flag value when unset, but keep
    // the precedence visible by reporting it as "env" when present.
    if let Some(p) = std::env::var_os("NEOLINK_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    let meta = fs::metadata(&p);
    if let Ok(m) = meta {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("neolink.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["neolink.toml", "neolink.yaml", "neolink.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no neolink.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    // Linux: system-wide default.
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/neolink/neolink.toml"));
    }

    // Other OSes: per-user config dir.
    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("net", "neoproxy", "neolink")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("neolink.toml"))
    }
}

pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!("config: {} exists but is not a regular file", path.display());
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(&fc)
}

/// CLI flags that take precedence over file values.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub access_key: Option<String>,
    pub local_port: Option<u16>,
    pub disable_tcp: bool,
    pub disable_udp: bool,
    pub enable_proxy_protocol: bool,
    pub no_reconnect: bool,
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_addr: String,
    pub control_port: u16,
    pub data_port: u16,
    pub access_key: String,
    pub local_domain: String,
    pub local_port: u16,
    /// Locale reported during the handshake; empty means "detect from env".
    pub locale: String,
    pub tcp_enabled: bool,
    pub udp_enabled: bool,
    pub proxy_protocol_passthrough: bool,
    pub buffer_size: usize,
    pub dial_timeout: Duration,
    pub heartbeat_delay: Duration,
    pub reconnect: ReconnectConfig,
    pub auto_update: bool,
    pub proxy_to_server: String,
    pub proxy_to_local: String,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    server_addr: String,

    control_port: Option<u16>,

    data_port: Option<u16>,

    #[serde(default)]
    access_key: String,

    #[serde(default)]
    local_domain: String,

    #[serde(default)]
    local_port: u16,

    #[serde(default)]
    locale: String,

    relay: Option<FileRelay>,

    heartbeat: Option<FileHeartbeat>,

    reconnect: Option<FileReconnect>,

    update: Option<FileUpdate>,

    proxy: Option<FileProxy>,

    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
struct FileRelay {
    tcp_enabled: Option<bool>,
    udp_enabled: Option<bool>,
    #[serde(default)]
    proxy_protocol_passthrough: bool,
    #[serde(default)]
    buffer_size: i64,
    dial_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileHeartbeat {
    delay_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileReconnect {
    enabled: Option<bool>,
    interval_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileUpdate {
    auto: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FileProxy {
    to_server: Option<String>,
    to_local: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

impl Config {
    fn from_file_config(fc: &FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            server_addr: fc.server_addr.trim().to_string(),
            control_port: fc.control_port.unwrap_or(44801),
            data_port: fc.data_port.unwrap_or(44802),
            access_key: fc.access_key.trim().to_string(),
            local_domain: fc.local_domain.trim().to_string(),
            local_port: fc.local_port,
            locale: fc.locale.trim().to_string(),
            tcp_enabled: true,
            udp_enabled: true,
            proxy_protocol_passthrough: false,
            buffer_size: 0,
            dial_timeout: Duration::from_millis(5000),
            heartbeat_delay: Duration::from_millis(1000),
            reconnect: ReconnectConfig {
                enabled: fc.reconnect.as_ref().and_then(|r| r.enabled).unwrap_or(true),
                interval: Duration::from_secs(
                    fc.reconnect
                        .as_ref()
                        .and_then(|r| r.interval_secs)
                        .unwrap_or(30)
                        .max(0) as u64,
                ),
            },
            auto_update: fc.update.as_ref().and_then(|u| u.auto).unwrap_or(true),
            proxy_to_server: String::new(),
            proxy_to_local: String::new(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        if cfg.server_addr.is_empty() {
            cfg.server_addr = "localhost".into();
        }
        if cfg.local_domain.is_empty() {
            cfg.local_domain = "localhost".into();
        }

        if let Some(r) = &fc.relay {
            cfg.tcp_enabled = r.tcp_enabled.unwrap_or(true);
            cfg.udp_enabled = r.udp_enabled.unwrap_or(true);
            cfg.proxy_protocol_passthrough = r.proxy_protocol_passthrough;
            cfg.buffer_size = r.buffer_size.max(0) as usize;
            cfg.dial_timeout =
                Duration::from_millis(r.dial_timeout_ms.unwrap_or(5000).max(0) as u64);
        }
        if cfg.buffer_size == 0 {
            cfg.buffer_size = 64 * 1024;
        }
        if cfg.dial_timeout == Duration::from_millis(0) {
            cfg.dial_timeout = Duration::from_millis(5000);
        }

        if let Some(h) = &fc.heartbeat {
            cfg.heartbeat_delay = Duration::from_millis(h.delay_ms.unwrap_or(1000).max(0) as u64);
        }
        if cfg.heartbeat_delay == Duration::from_millis(0) {
            cfg.heartbeat_delay = Duration::from_millis(1000);
        }

        if let Some(p) = &fc.proxy {
            cfg.proxy_to_server = p.to_server.clone().unwrap_or_default().trim().to_string();
            cfg.proxy_to_local = p.to_local.clone().unwrap_or_default().trim().to_string();
        }

        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level {
                if !level.trim().is_empty() {
                    cfg.logging.level = level.trim().to_string();
                }
            }
            if let Some(fmt) = &l.format {
                if !fmt.trim().is_empty() {
                    cfg.logging.format = fmt.trim().to_string();
                }
            }
            if let Some(out) = &l.output {
                if !out.trim().is_empty() {
                    cfg.logging.output = out.trim().to_string();
                }
            }
            cfg.logging.add_source = l.add_source;
        }

        Ok(cfg)
    }

    pub fn apply_overrides(&mut self, ov: &Overrides) {
        if let Some(key) = &ov.access_key {
            self.access_key = key.trim().to_string();
        }
        if let Some(port) = ov.local_port {
            self.local_port = port;
        }
        if ov.disable_tcp {
            self.tcp_enabled = false;
        }
        if ov.disable_udp {
            self.udp_enabled = false;
        }
        if ov.enable_proxy_protocol {
            self.proxy_protocol_passthrough = true;
        }
        if ov.no_reconnect {
            self.reconnect.enabled = false;
        }
        if ov.debug {
            self.logging.level = "debug".into();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.access_key.is_empty() {
            anyhow::bail!("config: access_key is required (set it in the config file or pass --key)");
        }
        if self.local_port == 0 {
            anyhow::bail!("config: local_port is required (set it in the config file or pass --local-port)");
        }
        if !self.tcp_enabled && !self.udp_enabled {
            anyhow::bail!("config: both TCP and UDP relaying are disabled; nothing to serve");
        }
        Ok(())
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# NeoLink configuration (auto-generated)
#
# This file was created because NeoLink could not find a configuration file at
# the resolved config path.
#
# NeoLink connects outward to a public relay server and exposes a local TCP/UDP
# service to the internet through it. At minimum, set access_key and
# local_port (both can also be passed as --key / --local-port).

server_addr = "localhost"
control_port = 44801
data_port = 44802
access_key = ""

local_domain = "localhost"
local_port = 0

[relay]
tcp_enabled = true
udp_enabled = true
proxy_protocol_passthrough = false

[heartbeat]
delay_ms = 1000

[reconnect]
enabled = true
interval_secs = 30

[update]
auto = true

[proxy]
# Forward-proxy descriptors: "<kind>-><host>:<port>[@<user>;<password>]"
# with kind one of socks | http (anything else means direct).
to_server = ""
to_local = ""

[logging]
level = "info"
format = "text"
# stderr | stdout | discard | logs (daily-rotated file under ./logs) | <path>
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# NeoLink configuration (auto-generated)
#
# This file was created because NeoLink could not find a configuration file at
# the resolved config path.
#
# NeoLink connects outward to a public relay server and exposes a local TCP/UDP
# service to the internet through it. At minimum, set access_key and
# local_port (both can also be passed as --key / --local-port).

server_addr: "localhost"
control_port: 44801
data_port: 44802
access_key: ""

local_domain: "localhost"
local_port: 0

relay:
  tcp_enabled: true
  udp_enabled: true
  proxy_protocol_passthrough: false

heartbeat:
  delay_ms: 1000

reconnect:
  enabled: true
  interval_secs: 30

update:
  auto: true

proxy:
  # Forward-proxy descriptors: "<kind>-><host>:<port>[@<user>;<password>]"
  # with kind one of socks | http (anything else means direct).
  to_server: ""
  to_local: ""

logging:
  level: "info"
  format: "text"
  # stderr | stdout | discard | logs (daily-rotated file under ./logs) | <path>
  output: "stderr"
  add_source: false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "neolink_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn defaults_fill_in() {
        let dir = temp_dir("defaults");
        let cfg_path = dir.join("neolink.toml");

        std::fs::write(&cfg_path, "access_key = \"k\"\nlocal_port = 25565\n").expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");

        assert_eq!(cfg.server_addr, "localhost");
        assert_eq!(cfg.control_port, 44801);
        assert_eq!(cfg.data_port, 44802);
        assert!(cfg.tcp_enabled);
        assert!(cfg.udp_enabled);
        assert!(cfg.reconnect.enabled);
        assert_eq!(cfg.reconnect.interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_delay, Duration::from_millis(1000));
        assert!(cfg.validate().is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_fields_rejected() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("neolink.toml");

        std::fs::write(&cfg_path, "acess_key = \"typo\"\n").expect("write");
        assert!(load_config(&cfg_path).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn overrides_take_precedence() {
        let dir = temp_dir("overrides");
        let cfg_path = dir.join("neolink.toml");

        let toml = r#"
access_key = "from-file"
local_port = 1000

[relay]
tcp_enabled = true
udp_enabled = true

[reconnect]
enabled = true
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let mut cfg = load_config(&cfg_path).expect("load_config");

        cfg.apply_overrides(&Overrides {
            access_key: Some("from-cli".into()),
            local_port: Some(2000),
            disable_udp: true,
            no_reconnect: true,
            ..Default::default()
        });

        assert_eq!(cfg.access_key, "from-cli");
        assert_eq!(cfg.local_port, 2000);
        assert!(cfg.tcp_enabled);
        assert!(!cfg.udp_enabled);
        assert!(!cfg.reconnect.enabled);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn validate_requires_key_and_port() {
        let dir = temp_dir("validate");
        let cfg_path = dir.join("neolink.toml");

        std::fs::write(&cfg_path, "server_addr = \"relay.example.net\"\n").expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("access_key"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_config_loads() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("neolink.yaml");

        let yaml = r#"
access_key: "k"
local_port: 8080
proxy:
  to_server: "socks->127.0.0.1:7890@user;pass"
heartbeat:
  delay_ms: 250
"#;
        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.proxy_to_server, "socks->127.0.0.1:7890@user;pass");
        assert_eq!(cfg.heartbeat_delay, Duration::from_millis(250));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
