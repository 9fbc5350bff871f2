//! The remote blob channel: the only true polymorphism point in this crate.
//! A narrow capability set — send, fetch, delete, search-by-caption,
//! ensure-channel — abstracts whatever messaging backend actually stores
//! the bytes. The engine never assumes message-id ordering, size limits
//! beyond one encrypted chunk, or atomic multi-blob operations.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{Error, Result};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub trait RemoteBlobChannel: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Sends a bytes blob, returns a durable message id.
    fn send_blob<'a>(&'a self, channel_id: &'a str, bytes: Vec<u8>, caption: Option<&'a str>) -> BoxFuture<'a, i64>;

    /// Fetches a blob by message id. May fail with `Transient`,
    /// `RateLimited`, or `PathNotFound`.
    fn fetch_blob<'a>(&'a self, channel_id: &'a str, message_id: i64) -> BoxFuture<'a, Vec<u8>>;

    /// Best-effort batch delete, up to 100 ids per call.
    fn delete_blobs<'a>(&'a self, channel_id: &'a str, message_ids: &'a [i64]) -> BoxFuture<'a, ()>;

    /// Locates messages whose caption contains `substring`, newest first,
    /// capped at `limit`. Used only to find the catalogue snapshot.
    fn search_by_caption<'a>(
        &'a self,
        channel_id: &'a str,
        substring: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Vec<(i64, String)>>;

    /// Locates or creates the dedicated storage channel for `user_identity`;
    /// disables any message-TTL on it.
    fn ensure_channel<'a>(&'a self, user_identity: &'a str) -> BoxFuture<'a, String>;
}

#[derive(Debug, Clone)]
pub struct TelegramBotApiConfig {
    pub bot_token: String,
    pub chat_id: String,
}

/// Concrete `RemoteBlobChannel` over the Telegram Bot API.
///
/// Bot API has no message-search endpoint and no way for a bot to create a
/// channel, so two operations are implemented against the nearest available
/// primitive rather than literally: `search_by_caption` reads the channel's
/// pinned message (every catalogue upload re-pins its own message, so the
/// pinned message is always the newest backup); `ensure_channel` validates
/// the configured chat id rather than creating a channel.
pub struct TelegramBotApiChannel {
    config: TelegramBotApiConfig,
    client: reqwest::Client,
}

impl TelegramBotApiChannel {
    pub fn new(config: TelegramBotApiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.config.bot_token)
    }

    async fn call<T: for<'de> Deserialize<'de>>(&self, res: reqwest::Response) -> Result<T> {
        let status = res.status();
        let body = res.text().await.map_err(|e| Error::Remote {
            message: format!("read response failed: {e}"),
        })?;

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = serde_json::from_str::<TelegramResponse<serde_json::Value>>(&body)
                .ok()
                .and_then(|r| r.parameters)
                .and_then(|p| p.retry_after)
                .unwrap_or(1);
            return Err(Error::RateLimited(Duration::from_secs(retry_after)));
        }
        if !status.is_success() {
            return Err(Error::Transient {
                message: format!("telegram http {status}: {body}"),
            });
        }

        let parsed: TelegramResponse<T> = serde_json::from_str(&body).map_err(|e| Error::Remote {
            message: format!("invalid json: {e}; body={body}"),
        })?;
        if !parsed.ok {
            return Err(Error::Remote {
                message: parsed
                    .description
                    .unwrap_or_else(|| "telegram returned ok=false".to_string()),
            });
        }
        parsed.result.ok_or_else(|| Error::Remote {
            message: "missing result".to_string(),
        })
    }
}

impl RemoteBlobChannel for TelegramBotApiChannel {
    fn provider(&self) -> &'static str {
        "telegram.botapi"
    }

    fn send_blob<'a>(
        &'a self,
        channel_id: &'a str,
        bytes: Vec<u8>,
        caption: Option<&'a str>,
    ) -> BoxFuture<'a, i64> {
        Box::pin(async move {
            let part = reqwest::multipart::Part::bytes(bytes).file_name("blob.dat".to_string());
            let mut form = reqwest::multipart::Form::new()
                .text("chat_id", channel_id.to_string())
                .part("document", part);
            if let Some(caption) = caption {
                form = form.text("caption", caption.to_string());
            }

            let res = self
                .client
                .post(self.api_url("sendDocument"))
                .multipart(form)
                .send()
                .await
                .map_err(|e| Error::Transient {
                    message: format!("sendDocument request failed: {e}"),
                })?;

            let message: TelegramMessage = self.call(res).await?;
            Ok(message.message_id)
        })
    }

    fn fetch_blob<'a>(&'a self, channel_id: &'a str, message_id: i64) -> BoxFuture<'a, Vec<u8>> {
        Box::pin(async move {
            // Bot API has no "get message by id"; forwarding to the same
            // channel re-delivers the document so its file_id can be read.
            let res = self
                .client
                .post(self.api_url("forwardMessage"))
                .json(&serde_json::json!({
                    "chat_id": channel_id,
                    "from_chat_id": channel_id,
                    "message_id": message_id,
                }))
                .send()
                .await
                .map_err(|e| Error::Transient {
                    message: format!("forwardMessage failed: {e}"),
                })?;
            let forwarded: TelegramMessage = self.call(res).await?;
            let document = forwarded.document.ok_or_else(|| Error::PathNotFound {
                message: format!("message {message_id} has no document"),
            })?;

            let res = self
                .client
                .get(self.api_url("getFile"))
                .query(&[("file_id", &document.file_id)])
                .send()
                .await
                .map_err(|e| Error::Transient {
                    message: format!("getFile failed: {e}"),
                })?;
            let file: TelegramFile = self.call(res).await?;
            let file_path = file.file_path.ok_or_else(|| Error::PathNotFound {
                message: "getFile missing file_path".to_string(),
            })?;

            let download_url = format!(
                "https://api.telegram.org/file/bot{}/{file_path}",
                self.config.bot_token
            );
            let res = self.client.get(download_url).send().await.map_err(|e| Error::Transient {
                message: format!("file download failed: {e}"),
            })?;
            if !res.status().is_success() {
                return Err(Error::Transient {
                    message: format!("file download http {}", res.status()),
                });
            }
            let bytes = res.bytes().await.map_err(|e| Error::Transient {
                message: format!("file download read failed: {e}"),
            })?;
            Ok(bytes.to_vec())
        })
    }

    fn delete_blobs<'a>(&'a self, channel_id: &'a str, message_ids: &'a [i64]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for chunk in message_ids.chunks(100) {
                for message_id in chunk {
                    let res = self
                        .client
                        .post(self.api_url("deleteMessage"))
                        .json(&serde_json::json!({"chat_id": channel_id, "message_id": message_id}))
                        .send()
                        .await;
                    // Best-effort: a failed delete (already gone, etc.) is not fatal.
                    if let Ok(res) = res {
                        let _ = res.text().await;
                    }
                }
            }
            Ok(())
        })
    }

    fn search_by_caption<'a>(
        &'a self,
        channel_id: &'a str,
        substring: &'a str,
        _limit: usize,
    ) -> BoxFuture<'a, Vec<(i64, String)>> {
        Box::pin(async move {
            let res = self
                .client
                .post(self.api_url("getChat"))
                .json(&serde_json::json!({"chat_id": channel_id}))
                .send()
                .await
                .map_err(|e| Error::Transient {
                    message: format!("getChat failed: {e}"),
                })?;
            let chat: TelegramChat = self.call(res).await?;
            let pinned = match chat.pinned_message {
                Some(m) => m,
                None => return Ok(Vec::new()),
            };
            let caption = pinned.caption.unwrap_or_default();
            if caption.contains(substring) {
                Ok(vec![(pinned.message_id, caption)])
            } else {
                Ok(Vec::new())
            }
        })
    }

    fn ensure_channel<'a>(&'a self, _user_identity: &'a str) -> BoxFuture<'a, String> {
        Box::pin(async move { Ok(self.config.chat_id.clone()) })
    }
}

/// In-memory test double mirroring the semantics a real channel must
/// satisfy: durable message ids, best-effort delete, caption search.
#[derive(Debug, Default)]
pub struct InMemoryChannel {
    pub sent: AtomicUsize,
    next_id: std::sync::atomic::AtomicI64,
    inner: Mutex<HashMap<i64, (Vec<u8>, Option<String>)>>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl RemoteBlobChannel for InMemoryChannel {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn send_blob<'a>(
        &'a self,
        _channel_id: &'a str,
        bytes: Vec<u8>,
        caption: Option<&'a str>,
    ) -> BoxFuture<'a, i64> {
        Box::pin(async move {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            self.inner
                .lock()
                .await
                .insert(id, (bytes, caption.map(str::to_owned)));
            self.sent.fetch_add(1, Ordering::Relaxed);
            Ok(id)
        })
    }

    fn fetch_blob<'a>(&'a self, _channel_id: &'a str, message_id: i64) -> BoxFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.inner
                .lock()
                .await
                .get(&message_id)
                .map(|(bytes, _)| bytes.clone())
                .ok_or_else(|| Error::PathNotFound {
                    message: format!("no such message id: {message_id}"),
                })
        })
    }

    fn delete_blobs<'a>(&'a self, _channel_id: &'a str, message_ids: &'a [i64]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            for id in message_ids {
                inner.remove(id);
            }
            Ok(())
        })
    }

    fn search_by_caption<'a>(
        &'a self,
        _channel_id: &'a str,
        substring: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Vec<(i64, String)>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let mut matches: Vec<(i64, String)> = inner
                .iter()
                .filter_map(|(id, (_, caption))| {
                    caption
                        .as_ref()
                        .filter(|c| c.contains(substring))
                        .map(|c| (*id, c.clone()))
                })
                .collect();
            matches.sort_by(|a, b| b.0.cmp(&a.0));
            matches.truncate(limit);
            Ok(matches)
        })
    }

    fn ensure_channel<'a>(&'a self, user_identity: &'a str) -> BoxFuture<'a, String> {
        let id = format!("mem-channel:{user_identity}");
        Box::pin(async move { Ok(id) })
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    description: Option<String>,
    parameters: Option<TelegramResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct TelegramResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    #[serde(default)]
    document: Option<TelegramDocument>,
}

#[derive(Debug, Deserialize)]
struct TelegramDocument {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    #[serde(default)]
    pinned_message: Option<TelegramPinnedMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramPinnedMessage {
    message_id: i64,
    #[serde(default)]
    caption: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_channel_round_trips_and_searches() {
        let channel = InMemoryChannel::new();
        let id = channel
            .send_blob("chan", b"hello".to_vec(), Some("#catalogue_backup db_version:3"))
            .await
            .unwrap();

        let fetched = channel.fetch_blob("chan", id).await.unwrap();
        assert_eq!(fetched, b"hello");

        let found = channel
            .search_by_caption("chan", "#catalogue_backup", 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, id);

        channel.delete_blobs("chan", &[id]).await.unwrap();
        assert!(channel.fetch_blob("chan", id).await.is_err());
    }
}
