mod backend;
mod config;
mod envelope;
mod flow_log;
mod listener;
mod relay;
mod reporter;
mod secrets;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use backend::{Deliver, HttpBackend};
use config::ServiceConfig;
use relay::Relay;
use secrets::{SecretManager, SecretStore};

/// Init failure: log and exit.
fn fatal(msg: &str, error: &dyn std::fmt::Display) -> ! {
    error!(%error, "{msg}");
    std::process::exit(1);
}

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let level = std::env::var("FLOWLOG_RELAY_LOG_LEVEL")
        .ok()
        .and_then(|val| {
            val.parse::<LevelFilter>().ok().or_else(|| {
                eprintln!("invalid FLOWLOG_RELAY_LOG_LEVEL: {val:?}, defaulting to INFO");
                None
            })
        })
        .unwrap_or(LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(level)
        .with(tracing_microjson::JsonLayer::new(std::io::stderr).with_target(true))
        .init();
}

fn setup_rustls() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls ring provider");
}

/// Resolve SIGTERM (what Cloud Run sends) or Ctrl-C into `cancel`.
async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(%e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    cancel.cancel();
}

async fn run<D, S>(relay: Relay<D, S>, listener: TcpListener)
where
    D: Deliver + Send + Sync + 'static,
    S: SecretStore + Send + Sync + 'static,
{
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    listener::serve(listener, Arc::new(relay), cancel).await;
}

#[tokio::main]
async fn main() {
    setup_logging();
    setup_rustls();

    let config = ServiceConfig::from_env().unwrap_or_else(|e| fatal("config error", &e));

    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .unwrap_or_else(|e| fatal("failed to build HTTP client", &e));

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .unwrap_or_else(|e| fatal("failed to bind push listener", &e));
    info!(
        port = config.port,
        timeout_ms = config.request_timeout.as_millis() as u64,
        "flowlog relay listening"
    );

    let backend = HttpBackend::new(client.clone());
    match SecretManager::from_vars(client, &config::env_snapshot()) {
        Some(secrets) => run(Relay::new(backend, secrets), listener).await,
        None => run(Relay::new(backend, secrets::NoSecretStore), listener).await,
    }
}
