use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;

use crate::neolink::{config, logging, tunnel, update};

pub async fn run(config_path: Option<PathBuf>, overrides: config::Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let mut cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    cfg.apply_overrides(&overrides);

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
        tracing::warn!("config: fill in access_key and local_port, then start again");
        return Ok(());
    }

    cfg.validate()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %resolved.path.display(),
        server = %cfg.server_addr,
        control_port = cfg.control_port,
        data_port = cfg.data_port,
        "neolink: starting"
    );
    if !cfg.tcp_enabled {
        tracing::warn!("neolink: TCP relaying is disabled, inbound TCP requests will be ignored");
    }
    if !cfg.udp_enabled {
        tracing::warn!("neolink: UDP relaying is disabled, inbound UDP requests will be ignored");
    }

    let client = Arc::new(
        tunnel::Client::new(Arc::new(cfg), Arc::new(update::ManualUpdater))
            .context("build tunnel client")?,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run(shutdown_rx).await })
    };

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal received");
            let _ = shutdown_tx.send(true);
        }
        res = &mut runner => {
            return match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.into()),
                Err(join_err) => Err(join_err.into()),
            };
        }
    }

    // Give the session a moment to close its relays.
    match tokio::time::timeout(Duration::from_secs(5), &mut runner).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => return Err(err.into()),
        Ok(Err(join_err)) => return Err(join_err.into()),
        Err(_) => {
            tracing::warn!("shutdown: session did not stop in time, aborting");
            runner.abort();
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "shutdown: failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
