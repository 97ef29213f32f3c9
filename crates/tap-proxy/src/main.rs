use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tap_core::{ProxyConfig, ProxyEngine};
use tap_observe::{NoopRecordSink, RecordLogSink, RecordSink};
use tap_proxy::ProxyServer;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Recording forward HTTP/HTTPS proxy: forwards plain HTTP, tunnels CONNECT,
/// and captures request/response bodies under the given directory.
#[derive(Debug, Parser)]
#[command(name = "tapproxy", version)]
struct Cli {
    /// Directory receiving captured request and response body files.
    capture_dir: PathBuf,

    #[arg(long, default_value = "127.0.0.1")]
    listen_addr: String,

    #[arg(long, default_value_t = 8080)]
    listen_port: u16,

    /// Append completed-exchange records to this file as JSON lines.
    #[arg(long)]
    record_log: Option<PathBuf>,

    /// Upstream dial timeout in milliseconds; unbounded when absent.
    #[arg(long)]
    connect_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ProxyConfig {
        listen_addr: cli.listen_addr,
        listen_port: cli.listen_port,
        capture_dir: cli.capture_dir,
        upstream_connect_timeout_ms: cli.connect_timeout_ms,
        ..ProxyConfig::default()
    };

    let sink: Box<dyn RecordSink> = match cli.record_log {
        Some(path) => match RecordLogSink::create(&path) {
            Ok(sink) => Box::new(sink),
            Err(error) => {
                error!(path = %path.display(), %error, "unable to open record log");
                return ExitCode::FAILURE;
            }
        },
        None => Box::new(NoopRecordSink),
    };

    let server = match ProxyServer::new(ProxyEngine::new(config, sink)) {
        Ok(server) => server,
        Err(error) => {
            error!(%error, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let mut records = server.subscribe();
    tokio::spawn(async move {
        loop {
            match records.recv().await {
                Ok(record) => info!(
                    flow_id = record.flow_id,
                    method = %record.request.method,
                    url = %record.request.url,
                    status = record.response.status_code,
                    "exchange completed"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    info!(skipped, "record subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "proxy terminated");
            ExitCode::FAILURE
        }
    }
}
