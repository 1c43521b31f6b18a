#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use logrelay::config::Settings;
use logrelay::logger;
use logrelay::server::Gateway;

#[tokio::main]
async fn main() {
    let config_path = std::env::var("LOGRELAY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::args().nth(1).map(PathBuf::from));

    let settings = match Settings::load(config_path.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    init_tracing(&settings.server.log_level);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let gateway = match Gateway::build(settings, config_path) {
        Ok(gateway) => gateway,
        Err(err) => {
            error!("gateway startup failed: {err}");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };

    gateway.spawn_background();
    spawn_signal_handlers(&gateway);

    if let Err(err) = gateway.serve(listener).await {
        error!("server error: {err}");
        std::process::exit(1);
    }
    info!("gateway shutdown complete");
}

fn init_tracing(log_level: &str) {
    // Mute the noisy HTTP internals unless explicitly asked for.
    let filter = format!("h2=off,hyper=off,rustls=off,{}", log_level.to_lowercase());
    let subscriber = tracing_subscriber::fmt()
        .event_format(logger::Formatter)
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber was already installed");
    }
}

fn spawn_signal_handlers(gateway: &Gateway) {
    // SIGTERM / ctrl-c: graceful shutdown.
    let cancel: CancellationToken = gateway.cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining");
        cancel.cancel();
    });

    // SIGHUP: hot-reload the configuration snapshot.
    #[cfg(unix)]
    {
        let settings = gateway.state.settings.clone();
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading configuration");
                settings.reload();
            }
        });
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(_) => {
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
