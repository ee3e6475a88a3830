//! Write coalescing for the URB loop.
//!
//! `vhci-hcd` pipelines many small URBs; answering each with its own
//! `write(2)` dominates CPU at high report rates. Responses are appended to
//! a shared buffer and a flusher task drains it every `interval`, or as soon
//! as the buffered bytes pass `FLUSH_THRESHOLD`. A zero interval degenerates
//! to flush-on-every-write. The appender never holds the buffer lock across
//! the socket write: the flusher swaps the buffer out first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

pub(crate) const FLUSH_THRESHOLD: usize = 64 * 1024;
pub(crate) const BUFFER_CAPACITY: usize = 256 * 1024;

struct Shared {
    buf: Mutex<Vec<u8>>,
    wakeup: Notify,
    /// Zero-interval mode: every write wakes the flusher.
    eager: bool,
    closed: AtomicBool,
    broken: AtomicBool,
}

pub(crate) struct BatchedWriter {
    shared: Arc<Shared>,
    flusher: JoinHandle<()>,
}

impl BatchedWriter {
    pub(crate) fn new(writer: OwnedWriteHalf, interval: Duration) -> BatchedWriter {
        let shared = Arc::new(Shared {
            buf: Mutex::new(Vec::with_capacity(BUFFER_CAPACITY)),
            wakeup: Notify::new(),
            eager: interval.is_zero(),
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        });
        let flusher = tokio::spawn(flush_loop(writer, Arc::clone(&shared), interval));
        BatchedWriter { shared, flusher }
    }

    /// Queue response bytes. Ordering across calls is the write order of the
    /// single URB loop task.
    pub(crate) fn write(&self, bytes: &[u8]) {
        let over_threshold = {
            let mut buf = self.shared.buf.lock().expect("batch buffer lock");
            buf.extend_from_slice(bytes);
            buf.len() >= FLUSH_THRESHOLD
        };
        if over_threshold || self.shared.eager {
            self.shared.wakeup.notify_one();
        }
    }

    /// True once the underlying socket write failed; the URB loop treats it
    /// like a read-side disconnect.
    pub(crate) fn is_broken(&self) -> bool {
        self.shared.broken.load(Ordering::Acquire)
    }

    /// Flush what remains and stop the flusher.
    pub(crate) async fn shutdown(self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
        let _ = self.flusher.await;
    }
}

async fn flush_loop(mut writer: OwnedWriteHalf, shared: Arc<Shared>, interval: Duration) {
    loop {
        if interval.is_zero() {
            shared.wakeup.notified().await;
        } else {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shared.wakeup.notified() => {}
            }
        }

        let pending = {
            let mut buf = shared.buf.lock().expect("batch buffer lock");
            std::mem::take(&mut *buf)
        };
        if !pending.is_empty() {
            if let Err(e) = writer.write_all(&pending).await {
                debug!(error = %e, "urb response write failed");
                shared.broken.store(true, Ordering::Release);
                return;
            }
        }
        if shared.closed.load(Ordering::Acquire) {
            let leftover = {
                let mut buf = shared.buf.lock().expect("batch buffer lock");
                std::mem::take(&mut *buf)
            };
            if !leftover.is_empty() {
                let _ = writer.write_all(&leftover).await;
            }
            let _ = writer.shutdown().await;
            return;
        }
    }
}
