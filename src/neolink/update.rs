use tracing::warn;

/// Hook invoked when the server refuses our version and the operator opted
/// in to updates. Fetching and swapping binaries is out of scope here; the
/// default implementation tells the operator what to install.
pub trait Updater: Send + Sync {
    fn begin_update(&self, latest_version: Option<&str>);
}

#[derive(Debug, Default)]
pub struct ManualUpdater;

impl Updater for ManualUpdater {
    fn begin_update(&self, latest_version: Option<&str>) {
        match latest_version {
            Some(v) => warn!(latest = %v, "update: server requires a newer client, please upgrade"),
            None => warn!("update: server requires a newer client, please upgrade"),
        }
    }
}
