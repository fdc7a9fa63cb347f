//! RX Demultiplexer (spec §4.3).
//!
//! Sits between the Reader thread and everything that consumes bytes off
//! the wire. While `mode` is `Rpc`, completed lines and raw bytes feed the
//! bounded `rx_queue` that `send_command`/`read_file`/etc. block on. While
//! `mode` is `Console`, bytes instead feed an advisory ring buffer that
//! drops its oldest content under backpressure rather than block the
//! Reader thread — the Reader must never stall on a slow IDE websocket
//! consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Routing mode for incoming bytes. Kept as a standalone atomic (spec
/// design note, §9) so the Reader thread can check it on every byte
/// without contending with the per-operation session mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Rpc,
    Console,
}

const MODE_RPC: u8 = 0;
const MODE_CONSOLE: u8 = 1;

#[derive(Clone)]
pub struct ModeFlag(Arc<AtomicU8>);

impl Default for ModeFlag {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(MODE_RPC)))
    }
}

impl ModeFlag {
    pub fn get(&self) -> Mode {
        match self.0.load(Ordering::Acquire) {
            MODE_CONSOLE => Mode::Console,
            _ => Mode::Rpc,
        }
    }

    pub fn set(&self, mode: Mode) {
        let v = match mode {
            Mode::Rpc => MODE_RPC,
            Mode::Console => MODE_CONSOLE,
        };
        self.0.store(v, Ordering::Release);
    }
}

/// Bounded queue of raw bytes read while `mode == Rpc`. Backed by
/// `sync_channel` so a full queue blocks the Reader thread rather than
/// drop bytes — `send_command` and friends are expected to drain promptly,
/// and a blocked Reader is the signal that something downstream has
/// wedged.
pub struct RxQueue {
    tx: SyncSender<u8>,
    rx: Mutex<Receiver<u8>>,
}

impl RxQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity);
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
        })
    }

    /// Called from the Reader thread. Blocks if the queue is full.
    pub fn push(&self, byte: u8) {
        let _ = self.tx.send(byte);
    }

    /// Reads one byte, waiting at most `timeout`. `None` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<u8> {
        let rx = self.rx.lock().unwrap();
        match rx.recv_timeout(timeout) {
            Ok(b) => Some(b),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drains whatever is already queued without waiting, used when
    /// re-arming the queue across operations (e.g. after a reset).
    pub fn drain(&self) {
        let rx = self.rx.lock().unwrap();
        while rx.try_recv().is_ok() {}
    }
}

/// Drop-oldest ring buffer feeding the IDE's advisory console stream
/// (spec §4.3 "console_channel"). Readers block on [`ConsoleChannel::wait`]
/// until bytes are available; writers never block.
pub struct ConsoleChannel {
    buf: Mutex<VecDeque<u8>>,
    cap: usize,
    cv: Condvar,
}

impl ConsoleChannel {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            cap: capacity,
            cv: Condvar::new(),
        })
    }

    /// Called from the Reader thread; never blocks. Evicts the oldest
    /// byte(s) once `cap` is reached.
    pub fn push(&self, byte: u8) {
        let mut buf = self.buf.lock().unwrap();
        if buf.len() >= self.cap {
            buf.pop_front();
        }
        buf.push_back(byte);
        self.cv.notify_one();
    }

    /// Drains everything currently buffered, waiting up to `timeout` for
    /// at least one byte if the buffer is empty.
    pub fn wait(&self, timeout: Duration) -> Vec<u8> {
        let mut buf = self.buf.lock().unwrap();
        if buf.is_empty() {
            let (guard, _) = self.cv.wait_timeout(buf, timeout).unwrap();
            buf = guard;
        }
        buf.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_flag_round_trips() {
        let m = ModeFlag::default();
        assert_eq!(m.get(), Mode::Rpc);
        m.set(Mode::Console);
        assert_eq!(m.get(), Mode::Console);
    }

    #[test]
    fn rx_queue_recv_timeout_returns_none_when_empty() {
        let q = RxQueue::new(8);
        assert_eq!(q.recv_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn rx_queue_fifo_order() {
        let q = RxQueue::new(8);
        q.push(b'a');
        q.push(b'b');
        assert_eq!(q.recv_timeout(Duration::from_millis(10)), Some(b'a'));
        assert_eq!(q.recv_timeout(Duration::from_millis(10)), Some(b'b'));
    }

    #[test]
    fn console_channel_drops_oldest_under_pressure() {
        let c = ConsoleChannel::new(4);
        for b in b"abcdef" {
            c.push(*b);
        }
        let got = c.wait(Duration::from_millis(10));
        assert_eq!(got, b"cdef");
    }

    #[test]
    fn console_channel_wait_returns_empty_on_timeout() {
        let c = ConsoleChannel::new(4);
        let got = c.wait(Duration::from_millis(10));
        assert!(got.is_empty());
    }
}
