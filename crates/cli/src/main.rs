//! `tdrive`: a thin command-line consumer of `tdrive_core`, exercising
//! upload/download/status end to end against a single configured storage
//! channel. No daemon, no control socket: every invocation opens the
//! metadata/checkpoint stores itself and exits when the requested operation
//! finishes.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use tdrive_core::checkpoint::CheckpointStore;
use tdrive_core::config::Config;
use tdrive_core::metadata::{ItemType, MetadataStore};
use tdrive_core::progress::{ProgressSink, TaskProgress};
use tdrive_core::secrets::{self, Credentials};
use tdrive_core::storage::{RemoteBlobChannel, TelegramBotApiChannel, TelegramBotApiConfig};
use tdrive_core::sync::SyncCoordinator;
use tdrive_core::transfer::{new_task_id, ConcurrencyLimits, TransferEngine};

#[derive(Parser)]
#[command(name = "tdrive")]
#[command(about = "TDrive CLI", long_about = None)]
struct Cli {
    /// Emit machine-readable NDJSON progress events on stdout during transfers.
    #[arg(long, global = true)]
    events: bool,

    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store the bot token and chat id this identity talks to.
    SetBotToken {
        #[arg(long)]
        bot_token: String,
        #[arg(long)]
        chat_id: String,
    },
    /// List the contents of a folder (default: the root).
    Ls {
        #[arg(long, default_value_t = 0)]
        folder: i64,
    },
    Mkdir {
        #[arg(long, default_value_t = 0)]
        parent: i64,
        name: String,
    },
    Upload {
        local_path: PathBuf,
        #[arg(long, default_value_t = 0)]
        folder: i64,
        #[arg(long)]
        name: Option<String>,
    },
    UploadFolder {
        local_dir: PathBuf,
        #[arg(long, default_value_t = 0)]
        parent: i64,
        #[arg(long)]
        name: Option<String>,
    },
    Download {
        #[arg(long)]
        binding: i64,
        #[arg(long)]
        out: PathBuf,
    },
    DownloadFolder {
        #[arg(long)]
        folder: i64,
        #[arg(long)]
        out: PathBuf,
    },
    Rm {
        #[arg(long)]
        binding: Option<i64>,
        #[arg(long)]
        folder: Option<i64>,
    },
    Restore {
        #[arg(long)]
        binding: Option<i64>,
        #[arg(long)]
        folder: Option<i64>,
    },
    /// Print a checkpoint task's denormalized view (main task + sub-tasks + parts).
    Status {
        task_id: String,
    },
    /// Force a catalogue upload/sync cycle against the remote channel.
    Sync,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), retryable: false }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), retryable: true }
    }
}

impl From<tdrive_core::Error> for CliError {
    fn from(e: tdrive_core::Error) -> Self {
        use tdrive_core::Error::*;
        let retryable = e.is_retriable();
        let code = match &e {
            InvalidName { .. } => "INVALID_OPERATION",
            AlreadyExists { .. } => "ITEM_ALREADY_EXISTS",
            PathNotFound { .. } => "PATH_NOT_FOUND",
            InvalidOperation { .. } => "INVALID_OPERATION",
            Auth { .. } => "INVALID_API_CREDENTIALS",
            RateLimited(_) => "FLOOD_WAIT_ERROR",
            Transient { .. } => "CONNECTION_FAILED",
            Integrity { .. } | Crypto => "TASK_FAILED",
            CatalogueCorrupt { .. } => "DB_READ_FAILED",
            Cancelled => "TASK_FAILED",
            _ => "INTERNAL_ERROR",
        };
        if retryable {
            CliError::retryable(code, e.to_string())
        } else {
            CliError::new(code, e.to_string())
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::new("INTERNAL_ERROR", e.to_string())
    }
}

struct NdjsonProgressSink {
    task_id: String,
    enabled: bool,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: TaskProgress) {
        if !self.enabled {
            return;
        }
        let line = serde_json::json!({
            "type": "task.progress",
            "taskId": self.task_id,
            "phase": p.phase,
            "filesTotal": p.files_total,
            "filesDone": p.files_done,
            "chunksTotal": p.chunks_total,
            "chunksDone": p.chunks_done,
            "bytesTotal": p.bytes_total,
            "bytesDone": p.bytes_done,
        });
        println!("{line}");
        let _ = std::io::stdout().flush();
    }
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join("tdrive")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e)
        .unwrap_or_else(|_| "{\"code\":\"INTERNAL_ERROR\",\"message\":\"json encode failed\",\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}

struct Session<C: RemoteBlobChannel> {
    metadata: Arc<MetadataStore>,
    engine: Arc<TransferEngine<C>>,
    sync: Arc<SyncCoordinator<C>>,
}

async fn open_session(config_dir: &std::path::Path, events: bool) -> Result<Session<TelegramBotApiChannel>, CliError> {
    let config_path = config_dir.join("config.toml");
    let config = Config::load_or_default(&config_path, &config_dir.join("data"))?;
    std::fs::create_dir_all(&config.data_dir)?;

    let user_identity = config.telegram.bot_token_key.clone();
    let cred_path = secrets::credential_cache_path(config_dir);
    let credentials = secrets::load(&cred_path, &user_identity)?
        .ok_or_else(|| CliError::new("INVALID_API_CREDENTIALS", "no credential cache for this identity; run `tdrive set-bot-token` first"))?;
    let bot_token = credentials
        .bot_token
        .clone()
        .ok_or_else(|| CliError::new("INVALID_API_CREDENTIALS", "credential cache has no bot token"))?;

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

    let sync = Arc::new(SyncCoordinator::new(channel.clone(), channel_id.clone(), metadata.clone(), config.metadata_db_path()));
    sync.restore_if_absent().await?;
    sync.sync().await?;

    let limits = ConcurrencyLimits::new(config.transfer.max_concurrent_transfers);
    let progress: Box<dyn ProgressSink> = if events {
        Box::new(NdjsonProgressSink { task_id: "cli".to_string(), enabled: true })
    } else {
        Box::new(tdrive_core::progress::NullSink)
    };
    let engine = Arc::new(TransferEngine::new(channel, channel_id, metadata.clone(), checkpoint, limits, progress));

    Ok(Session { metadata, engine, sync })
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli.config_dir.unwrap_or_else(default_config_dir);

    if let Command::SetBotToken { bot_token, chat_id } = &cli.cmd {
        let config_path = config_dir.join("config.toml");
        let mut config = Config::load_or_default(&config_path, &config_dir.join("data"))?;
        config.telegram.chat_id = chat_id.clone();
        config.save(&config_path)?;

        std::fs::create_dir_all(&config_dir)?;
        let cred_path = secrets::credential_cache_path(&config_dir);
        let user_identity = config.telegram.bot_token_key.clone();
        let mut credentials = secrets::load(&cred_path, &user_identity)?.unwrap_or_else(Credentials::default);
        credentials.bot_token = Some(bot_token.clone());
        secrets::save(&cred_path, &user_identity, &credentials)?;
        println!("{}", serde_json::json!({"status": "ok"}));
        return Ok(());
    }

    if let Command::Status { task_id } = &cli.cmd {
        let config_path = config_dir.join("config.toml");
        let checkpoint = CheckpointStore::open(&Config::load(&config_path)?.checkpoint_db_path()).await?;
        return match checkpoint.get_task(task_id).await? {
            Some(view) => {
                println!("{}", render_task_view(&view));
                Ok(())
            }
            None => Err(CliError::new("PATH_NOT_FOUND", format!("no such task: {task_id}"))),
        };
    }

    let session = open_session(&config_dir, cli.events).await?;

    match cli.cmd {
        Command::SetBotToken { .. } | Command::Status { .. } => unreachable!("handled above"),
        Command::Ls { folder } => {
            let folder_id = if folder == 0 { session.metadata.root_folder_id } else { folder };
            let entries = session.metadata.folder_contents(folder_id).await?;
            let rows: Vec<_> = entries
                .into_iter()
                .map(|e| {
                    serde_json::json!({
                        "kind": match e.kind { ItemType::Folder => "folder", ItemType::Binding => "binding" },
                        "id": e.id,
                        "name": e.name,
                        "size": e.size,
                        "hash": e.hash,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows).unwrap_or_default());
        }
        Command::Mkdir { parent, name } => {
            let parent_id = if parent == 0 { session.metadata.root_folder_id } else { parent };
            let id = session.metadata.add_folder(parent_id, &name).await?;
            println!("{}", serde_json::json!({"folder_id": id}));
        }
        Command::Upload { local_path, folder, name } => {
            let folder_id = if folder == 0 { session.metadata.root_folder_id } else { folder };
            let name = name.unwrap_or_else(|| {
                local_path.file_name().and_then(|s| s.to_str()).unwrap_or("file").to_string()
            });
            let task_id = new_task_id();
            let outcome = session
                .engine
                .upload_file(&task_id, &local_path, folder_id, &name, false, CancellationToken::new())
                .await?;
            session.sync.upload().await?;
            println!("{}", serde_json::json!({"task_id": task_id, "outcome": format!("{outcome:?}")}));
        }
        Command::UploadFolder { local_dir, parent, name } => {
            let parent_id = if parent == 0 { session.metadata.root_folder_id } else { parent };
            let name = name.unwrap_or_else(|| {
                local_dir.file_name().and_then(|s| s.to_str()).unwrap_or("folder").to_string()
            });
            let task_id = new_task_id();
            session
                .engine
                .upload_folder(&task_id, &local_dir, parent_id, &name, CancellationToken::new())
                .await?;
            session.sync.upload().await?;
            println!("{}", serde_json::json!({"task_id": task_id}));
        }
        Command::Download { binding, out } => {
            let path = session.engine.download_file(binding, &out, false, CancellationToken::new()).await?;
            println!("{}", serde_json::json!({"path": path.display().to_string()}));
        }
        Command::DownloadFolder { folder, out } => {
            session.engine.download_folder(folder, &out, CancellationToken::new()).await?;
            println!("{}", serde_json::json!({"status": "ok"}));
        }
        Command::Rm { binding, folder } => {
            match (binding, folder) {
                (Some(id), None) => session.metadata.soft_delete(id, ItemType::Binding).await?,
                (None, Some(id)) => session.metadata.soft_delete(id, ItemType::Folder).await?,
                _ => return Err(CliError::new("INVALID_OPERATION", "pass exactly one of --binding or --folder")),
            }
            session.sync.upload().await?;
            println!("{}", serde_json::json!({"status": "ok"}));
        }
        Command::Restore { binding, folder } => {
            match (binding, folder) {
                (Some(id), None) => session.metadata.restore(id, ItemType::Binding).await?,
                (None, Some(id)) => session.metadata.restore(id, ItemType::Folder).await?,
                _ => return Err(CliError::new("INVALID_OPERATION", "pass exactly one of --binding or --folder")),
            }
            session.sync.upload().await?;
            println!("{}", serde_json::json!({"status": "ok"}));
        }
        Command::Sync => {
            let outcome = session.sync.sync().await?;
            println!("{}", serde_json::json!({"outcome": format!("{outcome:?}")}));
        }
    }

    Ok(())
}

fn render_task_view(view: &tdrive_core::checkpoint::TaskView) -> String {
    let sub_tasks: Vec<_> = view
        .sub_tasks
        .iter()
        .map(|(sub, parts)| {
            serde_json::json!({
                "id": sub.id,
                "local_path": sub.local_path,
                "status": format!("{:?}", sub.status),
                "total_size": sub.total_size,
                "completed_parts": parts.iter().map(|p| p.part_num).collect::<Vec<_>>(),
            })
        })
        .collect();
    let main = serde_json::json!({
        "id": view.main.id,
        "status": format!("{:?}", view.main.status),
        "is_folder": view.main.is_folder,
        "total_size": view.main.total_size,
        "local_path": view.main.local_path,
        "error_message": view.main.error_message,
        "sub_tasks": sub_tasks,
    });
    serde_json::to_string_pretty(&main).unwrap_or_default()
}
