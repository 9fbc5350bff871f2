//! Progress reporting: an ephemeral event stream to whatever consumer is
//! watching a task, throttled so a chunk-by-chunk transfer doesn't saturate
//! it. The durable truth always lives in the checkpoint store; this is
//! advisory only.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub phase: String,
    pub files_total: Option<u64>,
    pub files_done: Option<u64>,
    pub chunks_total: Option<u64>,
    pub chunks_done: Option<u64>,
    pub bytes_total: Option<u64>,
    pub bytes_done: Option<u64>,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: TaskProgress);
}

/// A sink with no downstream consumer; used by default and in tests.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _progress: TaskProgress) {}
}

impl ProgressSink for Box<dyn ProgressSink> {
    fn on_progress(&self, progress: TaskProgress) {
        (**self).on_progress(progress)
    }
}

const THROTTLE: Duration = Duration::from_millis(30);

/// Wraps a [`ProgressSink`] so that at most one event per [`THROTTLE`]
/// window reaches it, keyed per task. The final event for a task
/// (completion or failure) should be sent via
/// [`ThrottledSink::flush`] to bypass the throttle, so consumers never miss
/// a terminal state.
pub struct ThrottledSink<S> {
    inner: S,
    last_sent: Mutex<Option<Instant>>,
}

impl<S: ProgressSink> ThrottledSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            last_sent: Mutex::new(None),
        }
    }

    pub fn on_progress(&self, progress: TaskProgress) {
        let mut last = self.last_sent.lock().unwrap();
        let now = Instant::now();
        let due = match *last {
            Some(prev) => now.duration_since(prev) >= THROTTLE,
            None => true,
        };
        if due {
            *last = Some(now);
            drop(last);
            self.inner.on_progress(progress);
        }
    }

    /// Sends unconditionally and resets the throttle window.
    pub fn flush(&self, progress: TaskProgress) {
        *self.last_sent.lock().unwrap() = Some(Instant::now());
        self.inner.on_progress(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicUsize>);
    impl ProgressSink for CountingSink {
        fn on_progress(&self, _progress: TaskProgress) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn throttles_bursts_within_the_window() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = ThrottledSink::new(CountingSink(count.clone()));

        for _ in 0..10 {
            sink.on_progress(TaskProgress::default());
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_always_sends() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = ThrottledSink::new(CountingSink(count.clone()));

        sink.on_progress(TaskProgress::default());
        sink.flush(TaskProgress::default());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
