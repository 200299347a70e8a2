//! Live multi-subscriber log broadcast for runs and builds.
//!
//! Each in-flight run or build owns one stream. Writes append to the history
//! and are pushed to every subscriber without blocking; a subscriber whose
//! channel is full simply misses that chunk. New subscribers first receive
//! the whole history as a single message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::error::{CicdError, Result};

/// Per-subscriber channel depth.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Anything that accepts output bytes.
pub trait OutputSink: Send + Sync {
    fn write(&self, chunk: &[u8]);
}

#[derive(Default)]
struct StreamInner {
    history: Vec<u8>,
    subscribers: Vec<mpsc::Sender<Vec<u8>>>,
    closed: bool,
}

#[derive(Default)]
pub struct OutputStream {
    inner: Mutex<StreamInner>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append and broadcast. Fails once the stream is closed.
    pub fn append(&self, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Err(CicdError::InvalidState("output stream is closed".to_string()));
        }
        inner.history.extend_from_slice(chunk);
        inner.subscribers.retain(|tx| match tx.try_send(chunk.to_vec()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    /// Subscribe. The receiver gets the history so far, then live chunks, and
    /// ends when the stream closes.
    pub fn subscribe(&self) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.history.is_empty() {
            let _ = tx.try_send(inner.history.clone());
        }
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        rx
    }

    pub fn history(&self) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }

    /// Close every subscriber channel and reject further writes.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).closed
    }
}

impl OutputSink for OutputStream {
    fn write(&self, chunk: &[u8]) {
        if let Err(e) = self.append(chunk) {
            tracing::debug!("Dropping output chunk: {e}");
        }
    }
}

/// Writes to the live stream and to a step-local buffer kept for persistence.
pub struct TeeSink {
    stream: Arc<OutputStream>,
    buffer: Mutex<Vec<u8>>,
}

impl TeeSink {
    pub fn new(stream: Arc<OutputStream>) -> Self {
        Self {
            stream,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl OutputSink for TeeSink {
    fn write(&self, chunk: &[u8]) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
        self.stream.write(chunk);
    }
}

/// Plain in-memory sink.
#[derive(Default)]
pub struct BufferSink {
    buffer: Mutex<Vec<u8>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl OutputSink for BufferSink {
    fn write(&self, chunk: &[u8]) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
    }
}

/// Registry of streams for in-flight runs and builds, keyed by run/build id.
#[derive(Default)]
pub struct OutputStreams {
    streams: RwLock<HashMap<String, Arc<OutputStream>>>,
}

impl OutputStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh stream, closing any previous one under the same id.
    pub fn open(&self, id: &str) -> Arc<OutputStream> {
        let stream = Arc::new(OutputStream::new());
        let previous = self
            .streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), stream.clone());
        if let Some(old) = previous {
            old.close();
        }
        stream
    }

    pub fn get(&self, id: &str) -> Option<Arc<OutputStream>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Close and forget the stream of a finished run/build.
    pub fn finish(&self, id: &str) {
        let removed = self
            .streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(stream) = removed {
            stream.close();
        }
    }

    pub fn len(&self) -> usize {
        self.streams.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keep the last `max` bytes of output, on a char boundary, with a marker.
pub fn truncate_output(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max {
        return text.into_owned();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...truncated...\n{}", &text[start..])
}
