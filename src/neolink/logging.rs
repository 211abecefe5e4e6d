use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::neolink::config;

/// Where log lines end up. The client traditionally keeps rotated files in a
/// `logs/` directory next to the binary; `logs` (or any directory path)
/// selects that behavior with daily rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogTarget {
    Stderr,
    Stdout,
    Discard,
    Directory(PathBuf),
    File(PathBuf),
}

impl LogTarget {
    fn parse(output: &str) -> LogTarget {
        match output {
            "" | "stderr" => LogTarget::Stderr,
            "stdout" => LogTarget::Stdout,
            "discard" => LogTarget::Discard,
            "logs" => LogTarget::Directory(PathBuf::from("logs")),
            other => {
                let p = PathBuf::from(other);
                if other.ends_with('/') || p.is_dir() {
                    LogTarget::Directory(p)
                } else {
                    LogTarget::File(p)
                }
            }
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, LogTarget::Stderr | LogTarget::Stdout)
    }
}

/// Keeps the non-blocking writer thread alive for the process lifetime.
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let target = LogTarget::parse(logging.output.trim());

    // RUST_LOG wins over the configured level when set.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(logging.level.trim())
            .or_else(|_| EnvFilter::try_new("info"))
            .context("logging: build level filter")?,
    };

    let (writer, guard) = open_writer(&target)?;
    let json = logging.format.trim().eq_ignore_ascii_case("json");

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(target.is_terminal() && !json)
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);
    let fmt_layer = if json {
        fmt_layer.json().boxed()
    } else {
        fmt_layer.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    Ok(LoggingRuntime { _guard: guard })
}

fn open_writer(target: &LogTarget) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match target {
        LogTarget::Stderr => Ok(tracing_appender::non_blocking(io::stderr())),
        LogTarget::Stdout => Ok(tracing_appender::non_blocking(io::stdout())),
        LogTarget::Discard => Ok(tracing_appender::non_blocking(io::sink())),
        LogTarget::Directory(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("logging: mkdir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "neolink.log");
            Ok(tracing_appender::non_blocking(appender))
        }
        LogTarget::File(path) => {
            let name = path
                .file_name()
                .with_context(|| format!("logging: no file name in {}", path.display()))?;
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            std::fs::create_dir_all(dir)
                .with_context(|| format!("logging: mkdir {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            Ok(tracing_appender::non_blocking(appender))
        }
    }
}
