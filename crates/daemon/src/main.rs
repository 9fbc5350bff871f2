//! `tdrived`: a thin long-running host process that owns one `core` engine
//! instance (metadata store, checkpoint store, transfer engine, catalogue
//! sync, file-existence watcher) for a single configured storage channel,
//! and exposes it over a local control socket.

mod control_ipc;

use std::path::PathBuf;
use std::sync::Arc;

use tdrive_core::checkpoint::CheckpointStore;
use tdrive_core::config::Config;
use tdrive_core::metadata::MetadataStore;
use tdrive_core::progress::NullSink;
use tdrive_core::secrets;
use tdrive_core::storage::{RemoteBlobChannel, TelegramBotApiChannel, TelegramBotApiConfig};
use tdrive_core::sync::SyncCoordinator;
use tdrive_core::transfer::{ConcurrencyLimits, TransferEngine};
use tdrive_core::watcher::{ExistenceChange, ExistenceSink, FileExistenceWatcher};
use tokio_util::sync::CancellationToken;

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join("tdrive")
}

fn control_socket_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("control.sock")
}

/// Logs existence transitions; the daemon has no UI to forward them to.
struct LoggingExistenceSink;

impl ExistenceSink for LoggingExistenceSink {
    fn on_change(&self, task_id: &str, change: ExistenceChange) {
        tracing::info!(
            event = "watcher.existence_changed",
            task_id,
            now_exists = change.now_exists,
            "watcher.existence_changed"
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config_dir = std::env::var("TDRIVE_CONFIG_DIR")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(default_config_dir);
    let config_path = config_dir.join("config.toml");
    let config = Config::load_or_default(&config_path, &config_dir.join("data"))?;
    std::fs::create_dir_all(&config.data_dir)?;

    let user_identity = config.telegram.bot_token_key.clone();
    let cred_path = secrets::credential_cache_path(&config_dir);
    let credentials = secrets::load(&cred_path, &user_identity)?.ok_or(
        "no credential cache for this identity; run `tdrive set-bot-token` first",
    )?;
    let bot_token = credentials
        .bot_token
        .clone()
        .ok_or("credential cache has no bot token")?;

    let channel = Arc::new(TelegramBotApiChannel::new(TelegramBotApiConfig {
        bot_token,
        chat_id: config.telegram.chat_id.clone(),
    }));
    let channel_id = match credentials.storage_channel_id.clone() {
        Some(id) => id,
        None => {
            let id = channel.ensure_channel(&user_identity).await?;
            let mut credentials = credentials;
            credentials.storage_channel_id = Some(id.clone());
            secrets::save(&cred_path, &user_identity, &credentials)?;
            id
        }
    };

    let metadata = Arc::new(MetadataStore::open(&config.metadata_db_path()).await?);
    let checkpoint = Arc::new(CheckpointStore::open(&config.checkpoint_db_path()).await?);
    checkpoint.reset_zombie_tasks().await?;

    let sync = Arc::new(SyncCoordinator::new(
        channel.clone(),
        channel_id.clone(),
        metadata.clone(),
        config.metadata_db_path(),
    ));
    if sync.restore_if_absent().await? {
        tracing::info!(event = "catalogue.restored", "catalogue.restored");
    }
    sync.sync().await?;

    let limits = ConcurrencyLimits::new(config.transfer.max_concurrent_transfers);
    let engine = Arc::new(TransferEngine::new(
        channel.clone(),
        channel_id,
        metadata.clone(),
        checkpoint,
        limits,
        Box::new(NullSink),
    ));

    let watcher = Arc::new(FileExistenceWatcher::new(
        metadata.clone(),
        config.transfer.watcher_poll_ms,
    ));
    let watcher_cancel = CancellationToken::new();
    let watcher_task = tokio::spawn({
        let watcher = watcher.clone();
        let cancel = watcher_cancel.clone();
        async move {
            watcher.run(Arc::new(LoggingExistenceSink), cancel).await;
        }
    });

    let registry = control_ipc::TaskRegistry::default();
    let _control = control_ipc::spawn(control_socket_path(&config.data_dir), engine.clone(), registry)?;

    tracing::info!(event = "daemon.started", data_dir = %config.data_dir.display(), "daemon.started");

    tokio::signal::ctrl_c().await?;
    watcher_cancel.cancel();
    let _ = watcher_task.await;
    tracing::info!(event = "daemon.stopped", "daemon.stopped");
    Ok(())
}
