//! Catalogue sync: backs the metadata store up to the remote channel as a
//! single zipped file, tagged with its db_version in the message caption.
//! Debounced and coalesced the way a mutation-triggered autosave should be,
//! guarded by one process-wide mutex so uploads and downloads never race.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::metadata::MetadataStore;
use crate::storage::RemoteBlobChannel;
use crate::{Error, Result};

pub const CATALOGUE_HASHTAG: &str = "#catalogue_backup";
const DEBOUNCE: Duration = Duration::from_secs(2);

fn caption_for(version: i64) -> String {
    format!("{CATALOGUE_HASHTAG} db_version:{version}")
}

fn parse_version(caption: &str) -> i64 {
    caption
        .split_whitespace()
        .find_map(|tok| tok.strip_prefix("db_version:"))
        .and_then(|v| v.parse().ok())
        .unwrap_or(-1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Uploaded,
    Downloaded,
    NoOp,
}

/// Owns the debounce timer and the single-flight mutex. One instance per
/// running engine; cheap to clone (`Arc` inside), so every mutation site can
/// hold a handle and call [`SyncCoordinator::schedule`].
pub struct SyncCoordinator<C: RemoteBlobChannel> {
    channel: Arc<C>,
    channel_id: String,
    metadata: Arc<MetadataStore>,
    db_path: PathBuf,
    guard: Arc<Mutex<()>>,
    pending: Arc<std::sync::Mutex<Option<Instant>>>,
    notify: Arc<Notify>,
}

impl<C: RemoteBlobChannel + 'static> SyncCoordinator<C> {
    pub fn new(channel: Arc<C>, channel_id: String, metadata: Arc<MetadataStore>, db_path: PathBuf) -> Self {
        Self {
            channel,
            channel_id,
            metadata,
            db_path,
            guard: Arc::new(Mutex::new(())),
            pending: Arc::new(std::sync::Mutex::new(None)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Schedules an upload `DEBOUNCE` from now. A call arriving before the
    /// window elapses pushes the deadline back out, coalescing bursts of
    /// metadata mutations into a single upload. Spawns the debounce worker
    /// on first call; subsequent calls just rearm the deadline.
    pub fn schedule(self: &Arc<Self>) {
        let deadline = Instant::now() + DEBOUNCE;
        let first = {
            let mut pending = self.pending.lock().unwrap();
            let first = pending.is_none();
            *pending = Some(deadline);
            first
        };
        if first {
            let this = self.clone();
            tokio::spawn(async move { this.debounce_worker().await });
        } else {
            self.notify.notify_one();
        }
    }

    async fn debounce_worker(self: Arc<Self>) {
        loop {
            let deadline = match *self.pending.lock().unwrap() {
                Some(d) => d,
                None => return,
            };

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.notify.notified() => continue,
            }

            // Deadline reached without a rearm in between; fire if nothing
            // rearmed it during the race window between the sleep waking up
            // and us taking the lock.
            let still_due = {
                let mut pending = self.pending.lock().unwrap();
                match *pending {
                    Some(d) if d <= Instant::now() => {
                        *pending = None;
                        true
                    }
                    _ => false,
                }
            };
            if still_due {
                let _ = self.upload().await;
                return;
            }
        }
    }

    /// Zips the metadata database and uploads it, then deletes any stale
    /// backup messages left over from previous uploads.
    pub async fn upload(&self) -> Result<()> {
        let _permit = self.guard.lock().await;
        let version = self.metadata.db_version().await?;
        let blob = zip_file(&self.db_path)?;
        let sent_id = self.channel.send_blob(&self.channel_id, blob, Some(&caption_for(version))).await?;

        let existing = self.channel.search_by_caption(&self.channel_id, CATALOGUE_HASHTAG, 50).await?;
        let stale: Vec<i64> = existing.into_iter().map(|(id, _)| id).filter(|id| *id != sent_id).collect();
        if !stale.is_empty() {
            self.channel.delete_blobs(&self.channel_id, &stale).await?;
        }
        Ok(())
    }

    /// Compares local and remote versions and reconciles: uploads if local
    /// is ahead, downloads-and-replaces if remote is ahead, no-ops if equal.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        let _permit = self.guard.lock().await;
        let local_version = self.metadata.db_version().await?;

        let remote = self.channel.search_by_caption(&self.channel_id, CATALOGUE_HASHTAG, 1).await?;
        let (remote_message_id, remote_version) = match remote.first() {
            Some((id, caption)) => (Some(*id), parse_version(caption)),
            None => (None, -1),
        };

        if local_version > remote_version {
            drop(_permit);
            self.upload().await?;
            Ok(SyncOutcome::Uploaded)
        } else if remote_version > local_version {
            let message_id = remote_message_id.expect("remote_version > -1 implies a backup message exists");
            self.download_and_replace(message_id).await?;
            Ok(SyncOutcome::Downloaded)
        } else {
            Ok(SyncOutcome::NoOp)
        }
    }

    /// Unconditional restore used at startup when the local database file is
    /// missing: downloads the newest remote backup if one exists.
    pub async fn restore_if_absent(&self) -> Result<bool> {
        if self.db_path.exists() {
            return Ok(false);
        }
        let _permit = self.guard.lock().await;
        let remote = self.channel.search_by_caption(&self.channel_id, CATALOGUE_HASHTAG, 1).await?;
        match remote.first() {
            Some((message_id, _)) => {
                let message_id = *message_id;
                drop(_permit);
                self.download_and_replace(message_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn download_and_replace(&self, message_id: i64) -> Result<()> {
        let blob = self.channel.fetch_blob(&self.channel_id, message_id).await?;
        let tmp_path = self.db_path.with_extension("db.sync-tmp");
        unzip_to(&blob, &tmp_path)?;

        if self.db_path.exists() {
            std::fs::remove_file(&self.db_path)?;
        }
        std::fs::rename(&tmp_path, &self.db_path)?;
        Ok(())
    }
}

const ZIP_ENTRY_NAME: &str = "metadata.db";

fn zip_file(db_path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(db_path)?;
    let mut buf = Vec::new();
    {
        let cursor = std::io::Cursor::new(&mut buf);
        let mut writer = zip::ZipWriter::new(cursor);
        let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        writer.start_file(ZIP_ENTRY_NAME, options)?;
        std::io::Write::write_all(&mut writer, &data)?;
        writer.finish()?;
    }
    Ok(buf)
}

fn unzip_to(blob: &[u8], dest: &Path) -> Result<()> {
    let cursor = std::io::Cursor::new(blob);
    let mut archive = zip::ZipArchive::new(cursor)?;
    let mut entry = archive.by_name(ZIP_ENTRY_NAME).map_err(|_| Error::CatalogueCorrupt {
        message: format!("zip archive missing {ZIP_ENTRY_NAME} entry"),
    })?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = std::fs::File::create(dest)?;
    std::io::copy(&mut entry, &mut out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryChannel;

    async fn new_store_and_coordinator(dir: &Path) -> (Arc<MetadataStore>, Arc<SyncCoordinator<InMemoryChannel>>) {
        let db_path = dir.join("metadata.db");
        let metadata = Arc::new(MetadataStore::open(&db_path).await.unwrap());
        let channel = Arc::new(InMemoryChannel::new());
        let coordinator = Arc::new(SyncCoordinator::new(channel, "chan".to_string(), metadata.clone(), db_path));
        (metadata, coordinator)
    }

    #[tokio::test]
    async fn upload_then_sync_from_scratch_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let (metadata, coordinator) = new_store_and_coordinator(dir.path()).await;
        metadata.add_folder(metadata.root_folder_id, "a").await.unwrap();
        coordinator.upload().await.unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let db_path2 = dir2.path().join("metadata.db");
        // A brand new local store has db_version 0 but a different file, so
        // directly compare sync() behavior using the original coordinator's
        // channel against a coordinator pointed at an empty path.
        let metadata2 = Arc::new(MetadataStore::open(&db_path2).await.unwrap());
        let coordinator2 = SyncCoordinator::new(coordinator.channel.clone(), "chan".to_string(), metadata2.clone(), db_path2.clone());
        std::fs::remove_file(&db_path2).ok();

        let restored = coordinator2.restore_if_absent().await.unwrap();
        assert!(restored);
        assert!(db_path2.exists());
    }

    #[tokio::test]
    async fn sync_is_noop_when_versions_match() {
        let dir = tempfile::tempdir().unwrap();
        let (_metadata, coordinator) = new_store_and_coordinator(dir.path()).await;
        coordinator.upload().await.unwrap();
        assert_eq!(coordinator.sync().await.unwrap(), SyncOutcome::NoOp);
    }

    #[tokio::test]
    async fn debounced_schedule_coalesces_bursts() {
        let dir = tempfile::tempdir().unwrap();
        let (metadata, coordinator) = new_store_and_coordinator(dir.path()).await;

        for _ in 0..5 {
            metadata.add_folder(metadata.root_folder_id, "burst").await.ok();
            coordinator.schedule();
        }

        tokio::time::sleep(Duration::from_millis(2300)).await;
        let found = coordinator
            .channel
            .search_by_caption("chan", CATALOGUE_HASHTAG, 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1, "bursts of schedule() should coalesce into one upload");
    }
}
