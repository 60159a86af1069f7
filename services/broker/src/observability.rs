use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the tracing subscriber: stdout plus a daily-rotating file
/// under the log dir. `RUST_LOG` wins over the configured default level.
/// The returned guard must be held for the life of the process or the
/// file writer stops flushing.
pub fn init_logging(log_dir: &Path, default_level: &str) -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let file_appender = tracing_appender::rolling::daily(log_dir, "quiverd.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let stdout_layer = tracing_subscriber::fmt::layer();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    guard
}

/// Install the Prometheus recorder, optionally with its HTTP listener.
/// Failures are logged and ignored so a busy metrics port never blocks
/// the broker from starting.
pub fn init_metrics(bind: Option<SocketAddr>) {
    let result = match bind {
        Some(addr) => PrometheusBuilder::new().with_http_listener(addr).install(),
        None => PrometheusBuilder::new()
            .install_recorder()
            .map(|_handle| ()),
    };
    if let Err(err) = result {
        tracing::warn!(error = %err, "metrics recorder not installed");
    }
}
