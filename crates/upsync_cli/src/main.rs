use std::{net::SocketAddr, path::Path, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};
use upsync_contract::{ConnectivitySnapshot, NetworkKind};
use upsync_control_plane::{
    build_router, AppState, AutoUploadPolicy, OrchestratorConfig, RetryCoordinator,
    UploadOrchestrator, DEFAULT_DEBOUNCE,
};
use upsync_dav::{DavBridge, DavEndpoint, HttpDavBridge, InMemoryDavBridge};
use upsync_storage::{StorageConfig, TransferStore};
use upsync_transfer::{TransportConfig, DEFAULT_CHUNK_SIZE};

#[derive(Debug, Parser)]
#[command(author, version, about = "Resumable WebDAV upload daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the upload engine and its HTTP control surface.
    Serve {
        #[arg(long, default_value = "config/upsync.toml")]
        config: PathBuf,
    },
    /// Print every transfer record as one JSON line.
    List {
        #[arg(long, default_value = "config/upsync.toml")]
        config: PathBuf,
    },
    /// Delete finished records.
    Clear {
        #[arg(long, default_value = "config/upsync.toml")]
        config: PathBuf,
        #[arg(long)]
        failed: bool,
        #[arg(long)]
        succeeded: bool,
        /// With --failed, keep records waiting for Wi-Fi.
        #[arg(long, requires = "failed")]
        keep_delayed_for_wifi: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeConfig {
    server: Option<ServerSection>,
    http: HttpSection,
    storage: StorageSection,
    #[serde(default)]
    transport: TransportSection,
    #[serde(default)]
    workers: WorkersSection,
    #[serde(default)]
    auto_upload: AutoUploadPolicy,
    #[serde(default)]
    connectivity: ConnectivitySection,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerSection {
    base_url: String,
    username: String,
    password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpSection {
    bind: String,
    auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageSection {
    sqlite_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct TransportSection {
    chunk_size: u64,
    connect_timeout_secs: u64,
    request_timeout_secs: u64,
    extended_timeout_secs: u64,
    diagnostics: bool,
}

impl Default for TransportSection {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout_secs: 30,
            request_timeout_secs: defaults.request_timeout.as_secs(),
            extended_timeout_secs: defaults.extended_timeout.as_secs(),
            diagnostics: false,
        }
    }
}

impl TransportSection {
    fn to_config(&self) -> TransportConfig {
        TransportConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            extended_timeout: Duration::from_secs(self.extended_timeout_secs),
            diagnostics: self.diagnostics,
            ..TransportConfig::default()
        }
        .with_chunk_size(self.chunk_size)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct WorkersSection {
    max_concurrent_uploads: usize,
    retry_debounce_ms: u64,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: OrchestratorConfig::default().max_concurrent_uploads,
            retry_debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
        }
    }
}

/// Networks assumed active at startup, until the host reports otherwise.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ConnectivitySection {
    initial: Vec<NetworkKind>,
}

impl Default for ConnectivitySection {
    fn default() -> Self {
        Self {
            initial: vec![NetworkKind::Wifi],
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::List { config } => list(config).await,
        Command::Clear {
            config,
            failed,
            succeeded,
            keep_delayed_for_wifi,
        } => clear(config, failed, succeeded, keep_delayed_for_wifi).await,
    }
}

fn load_config(config_path: &Path) -> Result<RuntimeConfig> {
    let config_source = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file {}", config_path.display()))?;
    toml::from_str(&config_source)
        .with_context(|| format!("invalid config TOML at {}", config_path.display()))
}

async fn open_store(config: &RuntimeConfig) -> Result<TransferStore> {
    let sqlite_path = Path::new(&config.storage.sqlite_path);
    if let Some(parent) = sqlite_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !config.storage.sqlite_path.starts_with("sqlite:") {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    TransferStore::connect(&StorageConfig {
        sqlite_path: config.storage.sqlite_path.clone(),
    })
    .await
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let store = open_store(&config).await?;

    let require_bearer = requires_token(&config.http.bind);
    if require_bearer && config.http.auth_token.is_none() {
        return Err(anyhow!(
            "non-loopback bind {} requires http.auth_token",
            config.http.bind
        ));
    }

    if !require_bearer {
        info!("loopback bind detected: bearer auth optional");
    } else {
        warn!("non-loopback bind detected: bearer auth enforced");
    }

    let bridge: Arc<dyn DavBridge> = match &config.server {
        Some(server) => {
            let endpoint = DavEndpoint {
                base_url: server.base_url.clone(),
                username: server.username.clone(),
                password: server.password.clone(),
            };
            let connect_timeout = Duration::from_secs(config.transport.connect_timeout_secs);
            info!(base_url = %server.base_url, user = %server.username, "using webdav server");
            let bridge = HttpDavBridge::new(endpoint, connect_timeout)
                .context("failed to build webdav client")?
                .with_request_timeout(Duration::from_secs(config.transport.request_timeout_secs));
            Arc::new(bridge)
        }
        None => {
            warn!("no [server] section: uploads go to an in-memory bridge");
            Arc::new(InMemoryDavBridge::new())
        }
    };

    let (connectivity_tx, connectivity_rx) =
        watch::channel(ConnectivitySnapshot::with(config.connectivity.initial.iter().copied()));
    let orchestrator = UploadOrchestrator::new(
        store.clone(),
        bridge,
        OrchestratorConfig {
            transport: config.transport.to_config(),
            max_concurrent_uploads: config.workers.max_concurrent_uploads.max(1),
            policy: config.auto_upload,
        },
        connectivity_rx.clone(),
    );

    let report = orchestrator.recover().await.context("startup recovery failed")?;
    info!(
        completed = report.completed,
        requeued = report.requeued,
        dispatched = report.dispatched,
        "startup recovery finished"
    );

    let _connectivity_watch = orchestrator.spawn_connectivity_watch();
    let coordinator = RetryCoordinator::new(store, Arc::new(orchestrator.clone()), config.auto_upload)
        .with_debounce(Duration::from_millis(config.workers.retry_debounce_ms));
    tokio::spawn(coordinator.run(connectivity_rx));

    let state = AppState::new(
        orchestrator,
        Arc::new(connectivity_tx),
        config.http.auth_token.clone(),
        require_bearer,
    );
    let app = build_router(state);

    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;

    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    info!(bind = %config.http.bind, "upsyncd control surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server failed")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn list(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let store = open_store(&config).await?;
    for record in store.list_all().await? {
        let line = serde_json::json!({
            "record": record,
            "reason": record.last_result_reason(),
        });
        println!("{line}");
    }
    Ok(())
}

async fn clear(config_path: PathBuf, failed: bool, succeeded: bool, keep_delayed_for_wifi: bool) -> Result<()> {
    if !failed && !succeeded {
        bail!("nothing to clear: pass --failed and/or --succeeded");
    }
    let config = load_config(&config_path)?;
    let store = open_store(&config).await?;
    if failed {
        let deleted = if keep_delayed_for_wifi {
            store.clear_failed_except_delayed_for_wifi().await?
        } else {
            store.clear_failed().await?
        };
        info!(deleted, "failed transfers cleared");
    }
    if succeeded {
        let deleted = store.clear_succeeded().await?;
        info!(deleted, "succeeded transfers cleared");
    }
    Ok(())
}

fn requires_token(bind: &str) -> bool {
    match bind.parse::<SocketAddr>() {
        Ok(addr) => !addr.ip().is_loopback(),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loopback_binds_skip_bearer_auth() {
        assert!(!requires_token("127.0.0.1:8088"));
        assert!(!requires_token("[::1]:8088"));
        assert!(requires_token("0.0.0.0:8088"));
        assert!(requires_token("not-an-address"));
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [http]
            bind = "127.0.0.1:8088"

            [storage]
            sqlite_path = "data/upsync.db"
            "#,
        )
        .expect("parse");

        assert!(config.server.is_none());
        assert_eq!(config.workers.max_concurrent_uploads, 2);
        assert_eq!(config.connectivity.initial, [NetworkKind::Wifi]);
        assert_eq!(config.transport.to_config(), TransportConfig::default());
        assert!(!config.auto_upload.any_requires_wifi());
    }

    #[test]
    fn full_config_round_trips_into_runtime_settings() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"
            [server]
            base_url = "https://cloud.example.com"
            username = "alice"

            [http]
            bind = "0.0.0.0:8088"
            auth_token = "s3cret"

            [storage]
            sqlite_path = "data/upsync.db"

            [transport]
            chunk_size = 1048576
            diagnostics = true

            [workers]
            max_concurrent_uploads = 4

            [auto_upload.pictures]
            enabled = true
            wifi_only = true

            [connectivity]
            initial = ["cellular"]
            "#
        )
        .expect("write config");

        let config = load_config(file.path()).expect("load");

        let server = config.server.expect("server section");
        assert_eq!(server.username, "alice");
        assert!(server.password.is_none());
        assert_eq!(config.http.auth_token.as_deref(), Some("s3cret"));
        let transport = config.transport.to_config();
        assert_eq!(transport.chunk_size, 1_048_576);
        assert!(transport.diagnostics);
        assert_eq!(config.workers.max_concurrent_uploads, 4);
        assert!(config.auto_upload.any_requires_wifi());
        assert_eq!(config.connectivity.initial, [NetworkKind::Cellular]);
    }

    #[test]
    fn missing_config_file_is_reported() {
        let err = load_config(Path::new("/nonexistent/upsync.toml")).expect_err("missing");
        assert!(err.to_string().contains("failed to read config file"));
    }
}
