//! Reactor bridge that records every call.

use std::collections::HashSet;
use std::io;

use parking_lot::Mutex;

use crate::bridge::{LocalSocket, ReactorBridge};

#[derive(Debug, Default)]
struct Recorded {
    writes: Vec<(LocalSocket, Vec<u8>)>,
    closes: Vec<LocalSocket>,
    wakes: usize,
    paused: HashSet<LocalSocket>,
    pause_changes: usize,
    /// Largest write a single `write_local` call accepts.
    write_limit: Option<usize>,
}

/// [`ReactorBridge`] that keeps what the shim sent to each local socket.
#[derive(Debug, Default)]
pub struct RecordingBridge {
    inner: Mutex<Recorded>,
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap how many bytes one `write_local` call takes.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.inner.lock().write_limit = limit;
    }

    pub fn writes(&self) -> Vec<(LocalSocket, Vec<u8>)> {
        self.inner.lock().writes.clone()
    }

    /// All bytes written to `sock`, concatenated.
    pub fn written_to(&self, sock: LocalSocket) -> Vec<u8> {
        self.inner
            .lock()
            .writes
            .iter()
            .filter(|(s, _)| *s == sock)
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }

    /// Closed sockets in call order.
    pub fn closes(&self) -> Vec<LocalSocket> {
        self.inner.lock().closes.clone()
    }

    pub fn close_count(&self) -> usize {
        self.inner.lock().closes.len()
    }

    /// Whether the shim currently has reads on `sock` paused.
    pub fn is_read_paused(&self, sock: LocalSocket) -> bool {
        self.inner.lock().paused.contains(&sock)
    }

    /// Number of pause or resume calls that changed a socket's state.
    pub fn pause_changes(&self) -> usize {
        self.inner.lock().pause_changes
    }

    pub fn wake_count(&self) -> usize {
        self.inner.lock().wakes
    }
}

impl ReactorBridge for RecordingBridge {
    fn write_local(&self, sock: LocalSocket, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        let n = inner.write_limit.map_or(data.len(), |l| l.min(data.len()));
        if n > 0 {
            inner.writes.push((sock, data[..n].to_vec()));
        }
        Ok(n)
    }

    fn close_local(&self, sock: LocalSocket) {
        self.inner.lock().closes.push(sock);
    }

    fn set_read_paused(&self, sock: LocalSocket, paused: bool) {
        let mut inner = self.inner.lock();
        let changed = if paused {
            inner.paused.insert(sock)
        } else {
            inner.paused.remove(&sock)
        };
        if changed {
            inner.pause_changes += 1;
        }
    }

    fn wake(&self) {
        self.inner.lock().wakes += 1;
    }
}
