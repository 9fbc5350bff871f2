//! Local control socket: a newline-delimited JSON request/response protocol
//! over a Unix domain socket, exposing the handful of operations a daemon
//! consumer of `core` actually needs (upload/download/pause/cancel/status).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use tdrive_core::storage::RemoteBlobChannel;
use tdrive_core::transfer::{new_task_id, TransferEngine, UploadOutcome};

/// Tracks the cancellation tokens of in-flight tasks so a later `pause` or
/// `cancel` request can reach the worker actually doing the transfer.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl TaskRegistry {
    async fn register(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().await.insert(task_id.to_string(), token.clone());
        token
    }

    async fn take(&self, task_id: &str) -> Option<CancellationToken> {
        self.tokens.lock().await.get(task_id).cloned()
    }

    async fn forget(&self, task_id: &str) {
        self.tokens.lock().await.remove(task_id);
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Request {
    UploadFile {
        local_path: String,
        folder_id: i64,
        name: String,
    },
    DownloadFile {
        binding_id: i64,
        target_dir: String,
    },
    Pause {
        task_id: String,
    },
    Cancel {
        task_id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response {
    Ok { task_id: String, detail: String },
    Error { message: String },
}

pub struct ControlIpcServerHandle {
    socket_path: PathBuf,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for ControlIpcServerHandle {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

pub fn spawn<C: RemoteBlobChannel + 'static>(
    socket_path: PathBuf,
    engine: Arc<TransferEngine<C>>,
    registry: TaskRegistry,
) -> std::io::Result<ControlIpcServerHandle> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        set_private(parent, 0o700)?;
    }
    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(&socket_path)?;
    #[cfg(unix)]
    set_private(&socket_path, 0o600)?;

    let task = tokio::spawn(accept_loop(listener, engine, registry));
    Ok(ControlIpcServerHandle { socket_path, task })
}

#[cfg(unix)]
fn set_private(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

async fn accept_loop<C: RemoteBlobChannel + 'static>(
    listener: UnixListener,
    engine: Arc<TransferEngine<C>>,
    registry: TaskRegistry,
) {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(event = "control.accept_failed", error = %e, "control.accept_failed");
                continue;
            }
        };
        tokio::spawn(handle_conn(stream, engine.clone(), registry.clone()));
    }
}

async fn handle_conn<C: RemoteBlobChannel + 'static>(
    stream: UnixStream,
    engine: Arc<TransferEngine<C>>,
    registry: TaskRegistry,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) => dispatch(req, &engine, &registry).await,
            Err(e) => Response::Error { message: format!("invalid request: {e}") },
        };
        let mut out = serde_json::to_string(&response).unwrap_or_default();
        out.push('\n');
        if write_half.write_all(out.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn dispatch<C: RemoteBlobChannel + 'static>(
    req: Request,
    engine: &Arc<TransferEngine<C>>,
    registry: &TaskRegistry,
) -> Response {
    match req {
        Request::UploadFile { local_path, folder_id, name } => {
            let task_id = new_task_id();
            let cancel = registry.register(&task_id).await;
            let result = engine
                .upload_file(&task_id, Path::new(&local_path), folder_id, &name, false, cancel)
                .await;
            registry.forget(&task_id).await;
            match result {
                Ok(UploadOutcome::Instant) => Response::Ok { task_id, detail: "deduplicated".to_string() },
                Ok(UploadOutcome::Transferred) => Response::Ok { task_id, detail: "transferred".to_string() },
                Err(e) => Response::Error { message: e.to_string() },
            }
        }
        Request::DownloadFile { binding_id, target_dir } => {
            let task_id = format!("dl_file_{binding_id}");
            let cancel = registry.register(&task_id).await;
            let result = engine
                .download_file(binding_id, Path::new(&target_dir), false, cancel)
                .await;
            registry.forget(&task_id).await;
            match result {
                Ok(path) => Response::Ok { task_id, detail: path.display().to_string() },
                Err(e) => Response::Error { message: e.to_string() },
            }
        }
        Request::Pause { task_id } => match registry.take(&task_id).await {
            Some(cancel) => match engine.pause(&task_id, &cancel).await {
                Ok(()) => Response::Ok { task_id, detail: "paused".to_string() },
                Err(e) => Response::Error { message: e.to_string() },
            },
            None => Response::Error { message: format!("no such in-flight task: {task_id}") },
        },
        Request::Cancel { task_id } => match registry.take(&task_id).await {
            Some(cancel) => {
                engine.cancel(&cancel);
                Response::Ok { task_id, detail: "cancelled".to_string() }
            }
            None => Response::Error { message: format!("no such in-flight task: {task_id}") },
        },
    }
}
