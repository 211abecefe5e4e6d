pub mod app;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod tunnel;
pub mod update;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    overrides: config::Overrides,
) -> anyhow::Result<()> {
    app::run(config_path, overrides).await
}
