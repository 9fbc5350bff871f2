//! Upload/download orchestration: hashing, dedup short-circuit, bounded
//! concurrency, per-chunk retry with backoff, pause/cancel, checkpoint
//! writes, and finalization.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::checkpoint::{CheckpointStore, ProgressPart, TaskKind, TaskStatus};
use crate::chunk::{self, ChunkStream, CHUNK_SIZE};
use crate::crypto;
use crate::metadata::{ChunkRef, ItemType, MetadataStore};
use crate::progress::{ProgressSink, TaskProgress, ThrottledSink};
use crate::storage::RemoteBlobChannel;
use crate::{Error, Result};

/// Generates a fresh task id for a caller-initiated upload (single file or
/// folder). Downloads use the deterministic `dl_file_{binding_id}` form
/// instead, so they never need one of these.
pub fn new_task_id() -> String {
    format!("up_{}", uuid::Uuid::new_v4().simple())
}

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(32);
const RETRY_MAX_ATTEMPTS: u32 = 5;
const RESUME_PERMITS: usize = 3;
const TRAFFIC_FLUSH_THRESHOLD: u64 = 512 * 1024;

/// Rate-limit errors sleep the authoritative duration and never count
/// against the attempt budget; other retriable errors (transient I/O, chunk
/// integrity) back off exponentially with jitter, up to
/// [`RETRY_MAX_ATTEMPTS`]; anything else propagates immediately.
pub async fn retry_with_backoff<F, Fut, T>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(Error::RateLimited(wait)) => {
                tokio::time::sleep(wait).await;
            }
            Err(e) if e.is_retriable() => {
                attempt += 1;
                if attempt >= RETRY_MAX_ATTEMPTS {
                    return Err(e);
                }
                let delay = std::cmp::min(RETRY_BASE * 2u32.pow(attempt - 1), RETRY_CAP);
                let jitter = Duration::from_secs_f64(rand::random::<f64>() * (delay.as_secs_f64() / 2.0));
                tokio::time::sleep(delay + jitter).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Process-wide concurrency caps: one configurable semaphore for new
/// transfers, one fixed at 3 permits for tasks resumed after a restart
/// (`self._resume_semaphore = asyncio.Semaphore(3)` in the original).
pub struct ConcurrencyLimits {
    pub new_transfers: Arc<Semaphore>,
    pub resumed_transfers: Arc<Semaphore>,
}

impl ConcurrencyLimits {
    pub fn new(max_concurrent_transfers: usize) -> Self {
        Self {
            new_transfers: Arc::new(Semaphore::new(max_concurrent_transfers.max(1))),
            resumed_transfers: Arc::new(Semaphore::new(RESUME_PERMITS)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Content already existed; a Binding was added with no network traffic.
    Instant,
    Transferred,
}

pub struct TransferEngine<C: RemoteBlobChannel> {
    channel: Arc<C>,
    channel_id: String,
    metadata: Arc<MetadataStore>,
    checkpoint: Arc<CheckpointStore>,
    limits: ConcurrencyLimits,
    progress: Arc<ThrottledSink<Box<dyn ProgressSink>>>,
    pending_traffic: AtomicU64,
}

impl<C: RemoteBlobChannel + 'static> TransferEngine<C> {
    pub fn new(
        channel: Arc<C>,
        channel_id: String,
        metadata: Arc<MetadataStore>,
        checkpoint: Arc<CheckpointStore>,
        limits: ConcurrencyLimits,
        progress: Box<dyn ProgressSink>,
    ) -> Self {
        Self {
            channel,
            channel_id,
            metadata,
            checkpoint,
            limits,
            progress: Arc::new(ThrottledSink::new(progress)),
            pending_traffic: AtomicU64::new(0),
        }
    }

    fn emit(&self, task_id: &str, phase: &str, bytes_total: Option<u64>, bytes_done: Option<u64>) {
        self.progress.on_progress(TaskProgress {
            task_id: task_id.to_string(),
            phase: phase.to_string(),
            bytes_total,
            bytes_done,
            ..Default::default()
        });
    }

    fn emit_folder_start(&self, task_id: &str, total_size: u64, file_count: u64) {
        self.progress.on_progress(TaskProgress {
            task_id: task_id.to_string(),
            phase: "starting_folder".to_string(),
            bytes_total: Some(total_size),
            bytes_done: Some(0),
            files_total: Some(file_count),
            files_done: Some(0),
            ..Default::default()
        });
    }

    /// Terminal events (`completed`/`failed`) bypass the throttle so a
    /// consumer never misses the final state of a task.
    fn emit_final(&self, task_id: &str, phase: &str, bytes_total: Option<u64>, bytes_done: Option<u64>) {
        self.progress.flush(TaskProgress {
            task_id: task_id.to_string(),
            phase: phase.to_string(),
            bytes_total,
            bytes_done,
            ..Default::default()
        });
    }

    async fn record_traffic(&self, bytes: u64) -> Result<()> {
        let pending = self.pending_traffic.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if pending >= TRAFFIC_FLUSH_THRESHOLD {
            let flushed = self.pending_traffic.swap(0, Ordering::SeqCst);
            let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
            self.checkpoint.record_traffic(&day, flushed as i64).await?;
        }
        Ok(())
    }

    /// Pauses a task: preserves its checkpoint row, flips status to
    /// `paused`, then signals the running worker to stop via `cancel`.
    pub async fn pause(&self, task_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.checkpoint.update_main_task_status(task_id, TaskStatus::Paused, None).await?;
        cancel.cancel();
        Ok(())
    }

    /// Cancels a task outright. Unlike `pause`, the checkpoint row is not
    /// pre-marked, so the worker observing cancellation sees a status other
    /// than `paused` and unwinds (removes the checkpoint row; for downloads,
    /// deletes the partial output file).
    pub fn cancel(&self, cancel: &CancellationToken) {
        cancel.cancel();
    }

    async fn is_pause(&self, task_id: &str) -> Result<bool> {
        Ok(matches!(
            self.checkpoint.get_task(task_id).await?.map(|v| v.main.status),
            Some(TaskStatus::Paused)
        ))
    }

    // ---- Upload (single file) --------------------------------------------

    pub async fn upload_file(
        &self,
        task_id: &str,
        local_path: &Path,
        folder_id: i64,
        name: &str,
        resumed: bool,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome> {
        let permit = self.acquire(resumed).await;

        let result = self.upload_file_inner(task_id, local_path, folder_id, name, cancel).await;
        drop(permit);
        result
    }

    async fn acquire(&self, resumed: bool) -> tokio::sync::OwnedSemaphorePermit {
        let sem = if resumed {
            self.limits.resumed_transfers.clone()
        } else {
            self.limits.new_transfers.clone()
        };
        sem.acquire_owned().await.expect("semaphore never closed")
    }

    async fn upload_file_inner(
        &self,
        task_id: &str,
        local_path: &Path,
        folder_id: i64,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome> {
        // Step 2: collision check, before any hashing.
        self.metadata.check_name_available(folder_id, name, ItemType::Binding).await?;

        let size = tokio::fs::metadata(local_path).await?.len();

        if self.checkpoint.get_task(task_id).await?.is_none() {
            self.checkpoint
                .create_main_task(task_id, TaskKind::Upload, false, &chunk::path_to_utf8(local_path)?, None)
                .await?;
            self.checkpoint
                .create_sub_tasks_bulk(task_id, &[(task_id.to_string(), chunk::path_to_utf8(local_path)?, size as i64)])
                .await?;
        }
        self.checkpoint.update_main_task_status(task_id, TaskStatus::Transferring, None).await?;
        self.checkpoint.update_main_task_total_size(task_id, size as i64).await?;

        // Step 3: whole-file hash, streamed.
        let path_owned = local_path.to_path_buf();
        let hash = tokio::task::spawn_blocking(move || crypto::hash_file(&path_owned))
            .await
            .map_err(join_err)??;
        self.checkpoint.update_sub_task_hash(task_id, &hash).await?;

        // Step 4: dedup probe ("instant upload").
        if let Some(_existing_content_id) = self.metadata.find_content_by_hash(&hash).await? {
            self.metadata.add_binding(folder_id, name, &hash, size as i64).await?;
            self.checkpoint.update_main_task_status(task_id, TaskStatus::Completed, None).await?;
            self.emit_final(task_id, "completed", Some(size), Some(size));
            self.checkpoint.delete_task(task_id).await?;
            self.trigger_sync();
            return Ok(UploadOutcome::Instant);
        }

        // Step 5: transfer.
        let key = crypto::derive_file_key(&hash);
        let completed: HashSet<u64> = self
            .checkpoint
            .completed_parts(task_id)
            .await?
            .into_iter()
            .map(|p| p.part_num as u64)
            .collect();

        let mut bytes_done: u64 = completed.len() as u64 * CHUNK_SIZE;
        let mut stream = ChunkStream::open(local_path, key, completed)?;

        loop {
            if cancel.is_cancelled() {
                return self.unwind_upload_cancel(task_id).await;
            }

            let (returned_stream, next) = tokio::task::spawn_blocking(move || {
                let r = stream.next_chunk();
                (stream, r)
            })
            .await
            .map_err(join_err)?;
            stream = returned_stream;

            let (part_num, encrypted) = match next? {
                Some(v) => v,
                None => break,
            };

            let part_hash = crypto::hash_bytes(&encrypted);
            let channel = self.channel.clone();
            let channel_id = self.channel_id.clone();
            let blob = encrypted.clone();
            let message_id = retry_with_backoff(|| {
                let channel = channel.clone();
                let channel_id = channel_id.clone();
                let blob = blob.clone();
                async move { channel.send_blob(&channel_id, blob, None).await }
            })
            .await?;

            self.checkpoint
                .add_progress_part(
                    task_id,
                    &ProgressPart {
                        part_num: part_num as i64,
                        message_id: Some(message_id),
                        hash: Some(part_hash),
                    },
                )
                .await?;

            bytes_done += encrypted.len() as u64;
            self.record_traffic(encrypted.len() as u64).await?;
            self.emit(task_id, "transferring", Some(size), Some(bytes_done));

            // Yield so a pending cancel is observed even between
            // back-to-back chunks with no awaited I/O in between.
            tokio::task::yield_now().await;
        }

        if cancel.is_cancelled() {
            return self.unwind_upload_cancel(task_id).await;
        }

        // Step 6: finalize.
        let parts = self.checkpoint.completed_parts(task_id).await?;
        let chunks: Vec<ChunkRef> = parts
            .into_iter()
            .map(|p| ChunkRef {
                part_num: p.part_num,
                message_id: p.message_id.expect("uploaded part always has a message id"),
                part_hash: p.hash.expect("uploaded part always has a hash"),
            })
            .collect();

        let (_binding_id, content_id) = self.metadata.finalize_upload(folder_id, name, &hash, size as i64, &chunks).await?;
        self.checkpoint.record_artifact(task_id, "content", content_id).await?;
        self.checkpoint.update_main_task_status(task_id, TaskStatus::Completed, None).await?;
        self.emit_final(task_id, "completed", Some(size), Some(size));
        self.checkpoint.delete_task(task_id).await?;
        self.trigger_sync();

        Ok(UploadOutcome::Transferred)
    }

    async fn unwind_upload_cancel(&self, task_id: &str) -> Result<UploadOutcome> {
        if self.is_pause(task_id).await? {
            return Err(Error::Cancelled);
        }
        // A true cancel: no Content/Binding/Chunk rows were ever created
        // for a not-yet-finalized upload, so unwinding is just dropping the
        // checkpoint row. Any blobs already sent are orphaned remotely.
        self.checkpoint.delete_task(task_id).await?;
        Err(Error::Cancelled)
    }

    /// Resumes a previously paused upload. Equivalent to calling
    /// `upload_file` again: the checkpoint's completed parts are picked up
    /// automatically, and this path uses the resume-reserved semaphore.
    pub async fn resume_upload(
        &self,
        task_id: &str,
        local_path: &Path,
        folder_id: i64,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome> {
        self.upload_file(task_id, local_path, folder_id, name, true, cancel).await
    }

    // ---- Upload (folder, recursive) ---------------------------------------

    pub async fn upload_folder(
        &self,
        task_id: &str,
        local_dir: &Path,
        target_parent_id: i64,
        folder_name: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        // Phase 1: dry-run scan for total size/file count before the first
        // progress event, per `upload_folder_recursive`'s two-phase shape.
        let mut total_size: u64 = 0;
        let mut file_count: u64 = 0;
        for entry in WalkDir::new(local_dir).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                total_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
                file_count += 1;
            }
        }

        self.checkpoint
            .create_main_task(task_id, TaskKind::Upload, true, &chunk::path_to_utf8(local_dir)?, None)
            .await?;
        self.checkpoint.update_main_task_total_size(task_id, total_size as i64).await?;
        self.emit_folder_start(task_id, total_size, file_count);

        let root_folder_id = match self.metadata.add_folder(target_parent_id, folder_name).await {
            Ok(id) => id,
            Err(Error::AlreadyExists { .. }) => {
                let contents = self.metadata.folder_contents(target_parent_id).await?;
                contents
                    .into_iter()
                    .find(|e| e.kind == ItemType::Folder && e.name == folder_name)
                    .map(|e| e.id)
                    .ok_or_else(|| Error::InvalidOperation {
                        message: format!("{folder_name} collides with a non-folder item"),
                    })?
            }
            Err(e) => return Err(e),
        };

        let mut folder_ids = std::collections::HashMap::new();
        folder_ids.insert(PathBuf::from("."), root_folder_id);

        let mut sub_task_id = 0usize;
        for entry in WalkDir::new(local_dir).into_iter().filter_map(|e| e.ok()) {
            let relative = entry.path().strip_prefix(local_dir).unwrap_or(entry.path());
            if entry.file_type().is_dir() {
                if relative.as_os_str().is_empty() {
                    continue;
                }
                let parent_rel = relative.parent().unwrap_or_else(|| Path::new("."));
                let parent_id = *folder_ids.get(parent_rel).unwrap_or(&root_folder_id);
                let name = relative.file_name().and_then(|s| s.to_str()).unwrap_or("folder");
                let id = match self.metadata.add_folder(parent_id, name).await {
                    Ok(id) => id,
                    Err(Error::AlreadyExists { .. }) => {
                        let contents = self.metadata.folder_contents(parent_id).await?;
                        contents
                            .into_iter()
                            .find(|e| e.kind == ItemType::Folder && e.name == name)
                            .map(|e| e.id)
                            .ok_or_else(|| Error::InvalidOperation {
                                message: format!("{name} collides with a non-folder item"),
                            })?
                    }
                    Err(e) => return Err(e),
                };
                folder_ids.insert(relative.to_path_buf(), id);
            } else if entry.file_type().is_file() {
                if cancel.is_cancelled() {
                    break;
                }
                let parent_rel = relative.parent().unwrap_or_else(|| Path::new("."));
                let parent_id = *folder_ids.get(parent_rel).unwrap_or(&root_folder_id);
                let name = relative.file_name().and_then(|s| s.to_str()).unwrap_or("file").to_string();

                sub_task_id += 1;
                let file_task_id = format!("{task_id}:f{sub_task_id}");
                self.upload_file(&file_task_id, entry.path(), parent_id, &name, false, cancel.clone()).await?;
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.checkpoint.update_main_task_status(task_id, TaskStatus::Completed, None).await?;
        self.checkpoint.delete_task(task_id).await?;
        Ok(())
    }

    // ---- Download (single file) -------------------------------------------

    pub async fn download_file(
        &self,
        binding_id: i64,
        target_dir: &Path,
        resumed: bool,
        cancel: CancellationToken,
    ) -> Result<PathBuf> {
        let permit = self.acquire(resumed).await;
        let result = self.download_file_inner(binding_id, target_dir, cancel).await;
        drop(permit);
        result
    }

    async fn download_file_inner(&self, binding_id: i64, target_dir: &Path, cancel: CancellationToken) -> Result<PathBuf> {
        let (name, content_id) = self.metadata.binding_info(binding_id).await?;
        let (hash, size) = self.metadata.content_hash_and_size(content_id).await?;
        let chunks = self.metadata.chunks_for_content(content_id).await?;
        let key = crypto::derive_file_key(&hash);

        let task_id = format!("dl_file_{binding_id}");

        let output_path = match self.checkpoint.get_task(&task_id).await? {
            Some(view) => PathBuf::from(view.main.local_path),
            None => {
                let path = chunk::unique_path(target_dir, &name);
                self.checkpoint
                    .create_main_task(&task_id, TaskKind::Download, false, &chunk::path_to_utf8(&path)?, None)
                    .await?;
                self.checkpoint
                    .create_sub_tasks_bulk(&task_id, &[(task_id.clone(), chunk::path_to_utf8(&path)?, size)])
                    .await?;
                path
            }
        };
        self.checkpoint.update_main_task_status(&task_id, TaskStatus::Transferring, None).await?;
        chunk::prepare_output(&output_path, size as u64)?;

        let completed: HashSet<u64> = self
            .checkpoint
            .completed_parts(&task_id)
            .await?
            .into_iter()
            .map(|p| p.part_num as u64)
            .collect();

        let mut bytes_done = completed.len() as u64 * CHUNK_SIZE;
        for chunk_ref in chunks.iter().filter(|c| !completed.contains(&(c.part_num as u64))) {
            if cancel.is_cancelled() {
                return self.unwind_download_cancel(&task_id, &output_path).await;
            }

            let part_num = chunk_ref.part_num;
            let message_id = chunk_ref.message_id;
            let expected_hash = chunk_ref.part_hash.clone();
            let channel = self.channel.clone();
            let channel_id = self.channel_id.clone();

            let encrypted = retry_with_backoff(|| {
                let channel = channel.clone();
                let channel_id = channel_id.clone();
                let expected_hash = expected_hash.clone();
                async move {
                    let bytes = channel.fetch_blob(&channel_id, message_id).await?;
                    if crypto::hash_bytes(&bytes) != expected_hash {
                        return Err(Error::Integrity {
                            message: format!("part {part_num} hash mismatch"),
                        });
                    }
                    Ok(bytes)
                }
            })
            .await?;

            let offset = (part_num as u64 - 1) * CHUNK_SIZE;
            let output_path_owned = output_path.clone();
            let key_owned = key;
            let encrypted_owned = encrypted.clone();
            tokio::task::spawn_blocking(move || chunk::write_decrypted(&encrypted_owned, &output_path_owned, &key_owned, offset))
                .await
                .map_err(join_err)??;

            self.checkpoint
                .add_progress_part(
                    &task_id,
                    &ProgressPart {
                        part_num,
                        message_id: Some(message_id),
                        hash: Some(expected_hash),
                    },
                )
                .await?;

            bytes_done += encrypted.len() as u64;
            self.record_traffic(encrypted.len() as u64).await?;
            self.emit(&task_id, "transferring", Some(size as u64), Some(bytes_done));
            tokio::task::yield_now().await;
        }

        if cancel.is_cancelled() {
            return self.unwind_download_cancel(&task_id, &output_path).await;
        }

        // Final whole-file hash check; ordering-independent correctness
        // witness regardless of what order chunks were fetched in.
        let output_path_owned = output_path.clone();
        let actual_hash = tokio::task::spawn_blocking(move || crypto::hash_file(&output_path_owned))
            .await
            .map_err(join_err)??;
        if actual_hash != hash {
            self.checkpoint
                .update_main_task_status(&task_id, TaskStatus::Failed, Some("whole-file hash mismatch"))
                .await?;
            return Err(Error::Integrity {
                message: "downloaded file does not match expected content hash".to_string(),
            });
        }

        self.checkpoint.update_main_task_status(&task_id, TaskStatus::Completed, None).await?;
        self.emit_final(&task_id, "completed", Some(size as u64), Some(size as u64));
        self.checkpoint.delete_task(&task_id).await?;

        Ok(output_path)
    }

    async fn unwind_download_cancel(&self, task_id: &str, output_path: &Path) -> Result<PathBuf> {
        if self.is_pause(task_id).await? {
            return Err(Error::Cancelled);
        }
        self.checkpoint.delete_task(task_id).await?;
        let _ = tokio::fs::remove_file(output_path).await;
        Err(Error::Cancelled)
    }

    // ---- Download (folder) -------------------------------------------------

    pub async fn download_folder(&self, folder_id: i64, target_dir: &Path, cancel: CancellationToken) -> Result<()> {
        let entries = self.metadata.list_recursive(folder_id).await?;

        for entry in &entries {
            if entry.kind == ItemType::Folder {
                tokio::fs::create_dir_all(target_dir.join(&entry.relative_path)).await?;
            }
        }

        for entry in entries.into_iter().filter(|e| e.kind == ItemType::Binding) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let parent_dir = Path::new(&entry.relative_path).parent().map(|p| target_dir.join(p)).unwrap_or_else(|| target_dir.to_path_buf());
            tokio::fs::create_dir_all(&parent_dir).await?;
            self.download_file(entry.id, &parent_dir, false, cancel.clone()).await?;
        }

        Ok(())
    }

    fn trigger_sync(&self) {
        // Catalogue sync is driven by `crate::sync::SyncCoordinator`, wired
        // in by the consumer that owns both this engine and the
        // coordinator; this hook exists so future wiring has a single call
        // site. Left a no-op here to avoid a circular dependency between
        // `transfer` and `sync`.
    }
}

fn join_err(e: tokio::task::JoinError) -> Error {
    Error::Other {
        message: format!("background task panicked: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryChannel;

    async fn new_engine() -> (tempfile::TempDir, TransferEngine<InMemoryChannel>) {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("meta.db")).await.unwrap());
        let checkpoint = Arc::new(CheckpointStore::open(&dir.path().join("checkpoint.db")).await.unwrap());
        let channel = Arc::new(InMemoryChannel::new());
        let engine = TransferEngine::new(
            channel,
            "chan".to_string(),
            metadata,
            checkpoint,
            ConcurrencyLimits::new(4),
            Box::new(crate::progress::NullSink),
        );
        (dir, engine)
    }

    #[tokio::test]
    async fn dedup_upload_is_instant_and_sends_no_bytes() {
        let (dir, engine) = new_engine().await;
        let data = vec![0u8; 4 * 1024 * 1024];
        let path_a = dir.path().join("a.bin");
        let path_b = dir.path().join("b.bin");
        std::fs::write(&path_a, &data).unwrap();
        std::fs::write(&path_b, &data).unwrap();

        let photos = engine.metadata.add_folder(engine.metadata.root_folder_id, "photos").await.unwrap();

        let outcome = engine
            .upload_file("t1", &path_a, photos, "a.bin", false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Transferred);
        let sent_after_first = engine.channel.sent.load(Ordering::SeqCst);
        assert!(sent_after_first > 0);

        let outcome = engine
            .upload_file("t2", &path_b, photos, "b.bin", false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Instant);
        assert_eq!(engine.channel.sent.load(Ordering::SeqCst), sent_after_first);

        let contents = engine.metadata.folder_contents(photos).await.unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents.iter().filter(|e| e.kind == ItemType::Binding).count(), 2);
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let (dir, engine) = new_engine().await;
        let data = (0..(CHUNK_SIZE * 2 + 123)).map(|i| (i % 251) as u8).collect::<Vec<u8>>();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, &data).unwrap();

        engine
            .upload_file("up1", &path, engine.metadata.root_folder_id, "big.bin", false, CancellationToken::new())
            .await
            .unwrap();

        let contents = engine.metadata.folder_contents(engine.metadata.root_folder_id).await.unwrap();
        let binding = contents.iter().find(|e| e.name == "big.bin").unwrap();

        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(&out_dir).unwrap();
        let output = engine.download_file(binding.id, &out_dir, false, CancellationToken::new()).await.unwrap();

        let downloaded = std::fs::read(&output).unwrap();
        assert_eq!(downloaded, data);
    }

    #[tokio::test]
    async fn resume_uses_persisted_completed_parts() {
        let (dir, engine) = new_engine().await;
        let data = vec![7u8; (CHUNK_SIZE * 3) as usize];
        let path = dir.path().join("resume.bin");
        std::fs::write(&path, &data).unwrap();

        // Simulate parts 1 and 2 already having completed on a prior run.
        let hash = crypto::hash_file(&path).unwrap();
        engine.checkpoint.create_main_task("resume1", TaskKind::Upload, false, path.to_str().unwrap(), None).await.unwrap();
        engine
            .checkpoint
            .create_sub_tasks_bulk("resume1", &[("resume1".to_string(), path.to_str().unwrap().to_string(), data.len() as i64)])
            .await
            .unwrap();
        engine.checkpoint.update_sub_task_hash("resume1", &hash).await.unwrap();
        for part in 1..=2u64 {
            engine
                .checkpoint
                .add_progress_part(
                    "resume1",
                    &ProgressPart {
                        part_num: part as i64,
                        message_id: Some(1000 + part as i64),
                        hash: Some(format!("fake-{part}")),
                    },
                )
                .await
                .unwrap();
        }

        engine
            .upload_file("resume1", &path, engine.metadata.root_folder_id, "resume.bin", true, CancellationToken::new())
            .await
            .unwrap();

        // Only part 3 should have gone over the (fake) wire.
        assert_eq!(engine.channel.sent.load(Ordering::SeqCst), 1);

        let content_id = engine.metadata.find_content_by_hash(&hash).await.unwrap().unwrap();
        let chunks = engine.metadata.chunks_for_content(content_id).await.unwrap();
        assert_eq!(chunks.iter().map(|c| c.part_num).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
