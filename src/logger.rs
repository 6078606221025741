//! Bounded in-memory log tails.
//!
//! One [`RingLogger`] exists per logical source ("proxy", "upstream"). Recent
//! bytes are kept in a ring buffer for replay to new SSE clients; live
//! listeners are invoked with each newly appended chunk only.

use crate::events::Subscription;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

/// Default history capacity per source.
pub const HISTORY_CAPACITY: usize = 256 * 1024;

type Listener = Box<dyn Fn(&[u8]) + Send + Sync>;

struct LoggerInner {
    buf: Mutex<VecDeque<u8>>,
    capacity: usize,
    next_id: AtomicU64,
    listeners: DashMap<u64, Listener>,
}

#[derive(Clone)]
pub struct RingLogger {
    inner: Arc<LoggerInner>,
}

impl Default for RingLogger {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl RingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                buf: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
                capacity,
                next_id: AtomicU64::new(0),
                listeners: DashMap::new(),
            }),
        }
    }

    /// Append bytes to the ring, discarding the oldest on overflow, then
    /// deliver only the new bytes to every live listener.
    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        {
            let mut buf = self.inner.buf.lock().expect("log buffer poisoned");
            // Oversized writes keep only their tail.
            let data = if data.len() > self.inner.capacity {
                &data[data.len() - self.inner.capacity..]
            } else {
                data
            };
            let overflow = (buf.len() + data.len()).saturating_sub(self.inner.capacity);
            buf.drain(..overflow);
            buf.extend(data);
        }

        for entry in self.inner.listeners.iter() {
            entry.value()(data);
        }
    }

    /// Copy of the current buffer contents.
    pub fn get_history(&self) -> Vec<u8> {
        let buf = self.inner.buf.lock().expect("log buffer poisoned");
        buf.iter().copied().collect()
    }

    /// Register a live listener. Each append delivers the new bytes only.
    pub fn on_log_data(&self, listener: impl Fn(&[u8]) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.insert(id, Box::new(listener));
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            inner.listeners.remove(&id);
        })
    }
}

/// `io::Write` adapter so a tracing fmt layer can tee into the ring.
pub struct RingWriter {
    logger: RingLogger,
}

impl io::Write for RingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.logger.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for RingLogger {
    type Writer = RingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RingWriter {
            logger: self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_returns_appended_bytes() {
        let logger = RingLogger::new();
        logger.append(b"hello ");
        logger.append(b"world");
        assert_eq!(logger.get_history(), b"hello world");
    }

    #[test]
    fn test_overflow_discards_oldest_bytes() {
        let logger = RingLogger::with_capacity(8);
        logger.append(b"abcdefgh");
        logger.append(b"XY");
        assert_eq!(logger.get_history(), b"cdefghXY");
    }

    #[test]
    fn test_oversized_write_keeps_tail() {
        let logger = RingLogger::with_capacity(4);
        logger.append(b"0123456789");
        assert_eq!(logger.get_history(), b"6789");
    }

    #[test]
    fn test_listener_sees_new_bytes_only() {
        let logger = RingLogger::new();
        logger.append(b"before");

        let seen: Arc<Mutex<Vec<u8>>> = Arc::default();
        let seen_clone = Arc::clone(&seen);
        let sub = logger.on_log_data(move |data| {
            seen_clone.lock().unwrap().extend_from_slice(data);
        });

        logger.append(b"after");
        assert_eq!(*seen.lock().unwrap(), b"after");

        drop(sub);
        logger.append(b"ignored");
        assert_eq!(*seen.lock().unwrap(), b"after");
    }
}
