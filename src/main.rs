use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tracing::Level;

use chatline_server::{
    AllowAnonymous, Authenticator, DeliveryScope, ServerConfig, SharedTokenAuthenticator,
};
use chatline_store::{Database, MessageStore, SqliteMessageStore};
use chatline_telemetry::{MetricsRecorder, TelemetryConfig};

/// Real-time chat message server.
#[derive(Debug, Parser)]
#[command(name = "chatline", version)]
struct Cli {
    /// Port to listen on.
    #[arg(long, env = "CHATLINE_PORT", default_value_t = 9091)]
    port: u16,

    /// Address to bind.
    #[arg(long, env = "CHATLINE_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Message database path. Defaults to ~/.chatline/database/chat.db.
    #[arg(long, env = "CHATLINE_DB")]
    db: Option<PathBuf>,

    /// Who receives each delivery payload: all | participants.
    #[arg(long, env = "CHATLINE_SCOPE", default_value_t = DeliveryScope::All)]
    scope: DeliveryScope,

    /// Shared secret clients must present. Without it every client is accepted.
    #[arg(long, env = "CHATLINE_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Outbound write timeout in seconds.
    #[arg(long, env = "CHATLINE_WRITE_TIMEOUT", default_value_t = 5)]
    write_timeout: u64,

    /// Default log level. RUST_LOG takes precedence.
    #[arg(long, env = "CHATLINE_LOG_LEVEL", default_value_t = Level::INFO)]
    log_level: Level,

    /// Log database path. Defaults to ~/.chatline/database/logs.db.
    #[arg(long, env = "CHATLINE_LOG_DB")]
    log_db: Option<PathBuf>,

    /// Do not persist warnings and errors to SQLite.
    #[arg(long, env = "CHATLINE_NO_LOG_DB")]
    no_log_db: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut telemetry = TelemetryConfig {
        log_level: cli.log_level,
        log_to_sqlite: !cli.no_log_db,
        ..Default::default()
    };
    if let Some(path) = &cli.log_db {
        telemetry.log_db_path.clone_from(path);
    }
    let _telemetry = chatline_telemetry::init_telemetry(&telemetry);

    tracing::info!("Starting chatline server");

    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| chatline_telemetry::data_dir().join("database").join("chat.db"));
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "Database opened");

    let store: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::new(db));
    let auth: Arc<dyn Authenticator> = match cli.auth_token {
        Some(token) => Arc::new(SharedTokenAuthenticator::new(&SecretString::from(token))),
        None => {
            tracing::warn!("No auth token configured, accepting anonymous clients");
            Arc::new(AllowAnonymous)
        }
    };

    let config = ServerConfig {
        bind_addr: cli.bind,
        port: cli.port,
        write_timeout: Duration::from_secs(cli.write_timeout),
        delivery_scope: cli.scope,
        ..Default::default()
    };
    let handle = chatline_server::start(config, store, auth, Arc::new(MetricsRecorder::new()))
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port(), "Chatline server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
