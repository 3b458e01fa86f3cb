use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod api_callbacks;
mod api_cameras;
mod api_docs;
mod camera;
mod config;
mod database;
mod errors;
mod handlers;
mod stream_manager;
mod utils;

use config::Config;
use database::{DatabaseProvider, SqliteDatabase};
use stream_manager::StreamManager;

#[derive(Parser, Debug, Clone)]
#[command(name = "cctv-manager", version, about = "Camera registry and RTMP relay control backend")]
pub struct Args {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,

    /// Override the listen host
    #[arg(long)]
    pub host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the SQLite database path
    #[arg(long)]
    pub database: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub database: Arc<dyn DatabaseProvider>,
    pub stream_manager: Arc<StreamManager>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cctv_manager=debug,info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config).unwrap_or_else(|e| {
        warn!("Could not load {} ({}), using default configuration", args.config, e);
        Config::default()
    });
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(database) = args.database {
        config.database.path = database;
    }
    config.validate()?;

    let database = SqliteDatabase::new(&config.database.path).await?;
    database.initialize().await?;
    let database: Arc<dyn DatabaseProvider> = Arc::new(database);

    let stream_manager = Arc::new(StreamManager::new(database.clone(), config.streaming.clone())?);
    let state = AppState {
        database,
        stream_manager: stream_manager.clone(),
    };

    let app = handlers::build_router(state, &config);
    let addr = format!("{}:{}", config.server.host, config.server.port);

    match &config.server.tls {
        Some(tls_config) if tls_config.enabled => {
            info!("Starting HTTPS server on {}", addr);
            start_https_server(app, &addr, tls_config).await?;
        }
        _ => {
            info!("Starting HTTP server on {}", addr);
            start_http_server(app, &addr).await?;
        }
    }

    let tracked = stream_manager.tracked_ids().await;
    if !tracked.is_empty() {
        info!("Stopping relays for cameras {:?}", tracked);
    }
    stream_manager.stop_all().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn start_http_server(app: axum::Router, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn start_https_server(app: axum::Router, addr: &str, tls_cfg: &config::TlsConfig) -> Result<()> {
    let rustls_config = load_rustls_config(tls_cfg)?;
    let socket_addr: std::net::SocketAddr = addr.parse()?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
    });

    info!("HTTPS server listening on https://{} (certificate {})", addr, tls_cfg.cert_path);
    axum_server::bind_rustls(socket_addr, axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(rustls_config)))
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("HTTPS server on {} failed: {}", addr, e))?;

    Ok(())
}

/// PEM certificate chain plus the first PKCS#8 key, or an RSA key when the
/// file holds no PKCS#8 entry.
fn load_rustls_config(tls_cfg: &config::TlsConfig) -> Result<rustls::ServerConfig> {
    let open = |path: &str, what: &str| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| anyhow::anyhow!("Cannot open TLS {} '{}': {}", what, path, e))
    };

    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut open(&tls_cfg.cert_path, "certificate")?)
        .map_err(|e| anyhow::anyhow!("Invalid certificate '{}': {}", tls_cfg.cert_path, e))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open(&tls_cfg.key_path, "key")?)
        .map_err(|e| anyhow::anyhow!("Invalid key '{}': {}", tls_cfg.key_path, e))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut open(&tls_cfg.key_path, "key")?)
            .map_err(|e| anyhow::anyhow!("Invalid RSA key '{}': {}", tls_cfg.key_path, e))?;
    }
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No private key in '{}'", tls_cfg.key_path))?;

    rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, rustls::PrivateKey(key))
        .map_err(|e| anyhow::anyhow!("Unusable TLS certificate/key pair: {}", e))
}
