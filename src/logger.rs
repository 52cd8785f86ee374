use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

/// Destination of flushed log batches
pub trait LogWriter: Send + Sync {
    fn write_batch(&self, entries: &[String]);
}

/// Timestamped lines on stderr (stdout is reserved for payloads)
#[derive(Debug, Default)]
pub struct ConsoleWriter;

impl LogWriter for ConsoleWriter {
    fn write_batch(&self, entries: &[String]) {
        let now = chrono::Local::now();
        let stamp = now.format("%Y-%m-%d %H:%M:%S%.3f");
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        for entry in entries {
            let _ = writeln!(out, "[{stamp}] {entry}");
        }
        let _ = out.flush();
    }
}

/// Keeps every flushed batch; handy for inspection and tests.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    batches: Mutex<Vec<Vec<String>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }

    pub fn entries(&self) -> Vec<String> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

impl LogWriter for MemoryWriter {
    fn write_batch(&self, entries: &[String]) {
        self.batches.lock().push(entries.to_vec());
    }
}

#[derive(Default)]
struct Queue {
    entries: Vec<String>,
    /// a flush is pending or running
    scheduled: bool,
}

struct SinkInner {
    queue: Mutex<Queue>,
    writer: Option<Arc<dyn LogWriter>>,
}

/// Coalescing, order-preserving event log.
///
/// `append` only enqueues. The first append of a tick schedules a flush on the
/// tokio runtime; everything queued by the time it runs goes out as one batch.
/// Only one flush is in flight at a time, so batches never interleave, and
/// entries appended while a batch is being written land in the next one.
///
/// "One tick" needs a single-threaded runtime (`current_thread` or a
/// `LocalSet`). On a multi-thread runtime the flush may run on another worker
/// in the middle of a burst and split it.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

impl LogSink {
    pub fn new(writer: Arc<dyn LogWriter>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                queue: Mutex::new(Queue::default()),
                writer: Some(writer),
            }),
        }
    }

    pub fn console() -> Self {
        Self::new(Arc::new(ConsoleWriter))
    }

    /// Sink that drops everything (logging switched off in config)
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(SinkInner {
                queue: Mutex::new(Queue::default()),
                writer: None,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.writer.is_some()
    }

    pub fn append(&self, text: impl Into<String>) {
        if !self.is_enabled() {
            return;
        }
        let schedule = {
            let mut queue = self.inner.queue.lock();
            queue.entries.push(text.into());
            !std::mem::replace(&mut queue.scheduled, true)
        };
        if schedule {
            self.schedule();
        }
    }

    /// Entries waiting for the next flush
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().entries.len()
    }

    fn schedule(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let sink = self.clone();
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    sink.flush_tick();
                });
            }
            // no runtime (plain sync caller): flush in place
            Err(_) => self.flush_tick(),
        }
    }

    fn flush_tick(&self) {
        let batch = std::mem::take(&mut self.inner.queue.lock().entries);
        if let (Some(writer), false) = (&self.inner.writer, batch.is_empty()) {
            writer.write_batch(&batch);
        }
        let again = {
            let mut queue = self.inner.queue.lock();
            if queue.entries.is_empty() {
                queue.scheduled = false;
                false
            } else {
                true
            }
        };
        if again {
            self.schedule();
        }
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("enabled", &self.is_enabled())
            .field("pending", &self.pending())
            .finish()
    }
}
