// =============================================================================
// Notification sink — best-effort, out-of-scope delivery kept at arm's length
// =============================================================================
//
// Telegram delivery itself is explicitly out of scope (spec §1); this module
// defines only the bounded-mailbox, rate-limited interface the engine
// dispatches through, plus a logging default. Swallow-and-log on failure,
// never block trading (spec §5, §7).

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, warn};

const MAX_CHUNK_CHARS: usize = 4096;
const MAILBOX_CAPACITY: usize = 256;
const MIN_INTERVAL: Duration = Duration::from_millis(500); // <= 2 msg/s

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, chunk: &str) -> anyhow::Result<()>;
}

/// Default sink: logs at warn level instead of delivering anywhere. Useful
/// standalone and as the fallback when no real sink is configured.
pub struct LogSink;

#[async_trait::async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, chunk: &str) -> anyhow::Result<()> {
        warn!(notification = %chunk, "notification (no sink configured)");
        Ok(())
    }
}

fn chunk_message(msg: &str) -> Vec<String> {
    if msg.len() <= MAX_CHUNK_CHARS {
        return vec![msg.to_string()];
    }
    msg.chars()
        .collect::<Vec<char>>()
        .chunks(MAX_CHUNK_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

/// A bounded mailbox in front of a `NotificationSink`. Producers call
/// `notify` (non-blocking, best-effort); a background task drains it at
/// <=2 msg/s, chunked at 4096 chars, dropping and logging on backpressure or
/// delivery failure rather than ever blocking a trading task.
pub struct Notifier {
    tx: mpsc::Sender<String>,
}

impl Notifier {
    pub fn spawn(sink: std::sync::Arc<dyn NotificationSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(MAILBOX_CAPACITY);
        tokio::spawn(async move {
            let mut last_sent = tokio::time::Instant::now() - MIN_INTERVAL;
            while let Some(msg) = rx.recv().await {
                for chunk in chunk_message(&msg) {
                    let elapsed = last_sent.elapsed();
                    if elapsed < MIN_INTERVAL {
                        tokio::time::sleep(MIN_INTERVAL - elapsed).await;
                    }
                    if let Err(e) = sink.deliver(&chunk).await {
                        error!(error = %e, "notification delivery failed, dropping");
                    }
                    last_sent = tokio::time::Instant::now();
                }
            }
        });
        Self { tx }
    }

    /// Never blocks the caller: if the mailbox is full the message is
    /// dropped and logged, trading continues unaffected.
    pub fn notify(&self, message: impl Into<String>) {
        if let Err(e) = self.tx.try_send(message.into()) {
            warn!(error = %e, "notification mailbox full, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl NotificationSink for CountingSink {
        async fn deliver(&self, _chunk: &str) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn short_message_is_not_chunked() {
        let chunks = chunk_message("hello");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "hello");
    }

    #[test]
    fn long_message_is_chunked_at_4096_chars() {
        let msg = "a".repeat(9000);
        let chunks = chunk_message(&msg);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[2].len(), 9000 - 2 * 4096);
    }

    #[tokio::test]
    async fn notifier_delivers_to_sink() {
        let sink = Arc::new(CountingSink { count: AtomicUsize::new(0) });
        let notifier = Notifier::spawn(sink.clone());
        notifier.notify("test message");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.count.load(Ordering::SeqCst), 1);
    }
}
