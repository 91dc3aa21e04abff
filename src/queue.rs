use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

/// Minimum spacing between queue-overflow warnings. Dropping is already
/// an overload signal; logging every drop would amplify it.
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Bounded FIFO between the reader tasks and the sender. `push` never
/// blocks: a full queue drops the newest line and counts it.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<Shared>,
}

struct Shared {
    tx: mpsc::Sender<String>,
    dropped: AtomicU64,
    last_warn: Mutex<Option<Instant>>,
}

impl OutboundQueue {
    /// Create a queue holding at most `depth` lines, plus the receiving
    /// half the sender drains.
    pub fn new(depth: usize) -> (OutboundQueue, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let queue = OutboundQueue {
            inner: Arc::new(Shared {
                tx,
                dropped: AtomicU64::new(0),
                last_warn: Mutex::new(None),
            }),
        };
        (queue, rx)
    }

    /// Returns true when the line was accepted.
    pub fn push(&self, line: String) -> bool {
        match self.inner.tx.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.warn_rate_limited(total);
                false
            }
            // Sender gone: only happens during shutdown.
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Lines dropped to overflow since startup.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn warn_rate_limited(&self, total: u64) {
        let mut last = self
            .inner
            .last_warn
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if last.is_none_or(|t| now.duration_since(t) >= DROP_WARN_INTERVAL) {
            *last = Some(now);
            tracing::warn!(total_dropped = total, "outbound queue full, dropping samples");
        }
    }
}
