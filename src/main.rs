mod neolink;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "neolink",
    version,
    about = "NeoLink - intranet traversal tunnel client"
)]
struct Cli {
    /// Path to NeoLink config file (.toml/.yaml/.yml). If omitted, uses NEOLINK_CONFIG; then auto-detects neolink.toml > neolink.yaml > neolink.yml from CWD; then falls back to the OS default path (Linux: /etc/neolink/neolink.toml; others: user config dir).
    #[arg(long, env = "NEOLINK_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Access key used to authenticate against the relay server.
    #[arg(long, env = "NEOLINK_KEY")]
    key: Option<String>,

    /// Port of the local service to expose.
    #[arg(long)]
    local_port: Option<u16>,

    /// Refuse inbound TCP relay requests.
    #[arg(long)]
    disable_tcp: bool,

    /// Refuse inbound UDP relay requests.
    #[arg(long)]
    disable_udp: bool,

    /// Forward proxy-protocol v2 headers to the local service instead of stripping them.
    #[arg(long)]
    enable_pp: bool,

    /// Do not reconnect automatically after a transport failure.
    #[arg(long)]
    no_reconnect: bool,

    /// Force debug-level logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    neolink::run(
        cli.config,
        neolink::config::Overrides {
            access_key: cli.key,
            local_port: cli.local_port,
            disable_tcp: cli.disable_tcp,
            disable_udp: cli.disable_udp,
            enable_proxy_protocol: cli.enable_pp,
            no_reconnect: cli.no_reconnect,
            debug: cli.debug,
        },
    )
    .await
}
