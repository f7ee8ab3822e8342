//! Virtual reader/writer: the queue-backed handles the stream fan-out
//! hands to a publisher's consumer task and to each viewer. Decoupling
//! the fan-out from the network means a slow viewer stalls only itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ripplecast_protocol::Packet;
use tokio::sync::mpsc;

/// Default per-writer max-idle deadline used by `alive_within` sweeps
/// (the stream fan-out's 5-second liveness sweep, §5).
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(10);

/// Sending half, held by the stream fan-out. Delivers packets into a
/// bounded queue; a full queue drops the newest packet and logs rather
/// than blocking the publisher or the other viewers.
#[derive(Clone)]
pub struct VirWriter {
    label: Arc<str>,
    tx: mpsc::Sender<Packet>,
    closed: Arc<AtomicBool>,
    last_active: Arc<Mutex<Instant>>,
}

/// Receiving half, held by the task that drains packets to one consumer
/// (a viewer's socket, or the HLS repackager).
pub struct VirReader {
    rx: mpsc::Receiver<Packet>,
    closed: Arc<AtomicBool>,
}

/// Builds a linked writer/reader pair with the given queue capacity.
pub fn channel(label: impl Into<Arc<str>>, capacity: usize) -> (VirWriter, VirReader) {
    let (tx, rx) = mpsc::channel(capacity);
    let closed = Arc::new(AtomicBool::new(false));
    (
        VirWriter {
            label: label.into(),
            tx,
            closed: closed.clone(),
            last_active: Arc::new(Mutex::new(Instant::now())),
        },
        VirReader { rx, closed },
    )
}

impl VirWriter {
    /// Non-blocking send. On a full queue the packet is dropped and a
    /// warning logged with the writer's label; the caller is not
    /// slowed down by a lagging consumer.
    pub fn write(&self, packet: Packet) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match self.tx.try_send(packet) {
            Ok(()) => *self.last_active.lock() = Instant::now(),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("{}: packet queue full, dropping newest packet", self.label);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::Release);
            }
        }
    }

    pub fn alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// `alive()` plus a bound on how long it's been since the last
    /// successful delivery, used by the 5-second liveness sweep to reap
    /// viewers that are connected but no longer draining their queue.
    pub fn alive_within(&self, max_idle: Duration) -> bool {
        self.alive() && self.last_active.lock().elapsed() <= max_idle
    }

    /// Idempotent. A second call is a no-op.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl VirReader {
    pub async fn read(&mut self) -> Option<Packet> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.rx.recv().await
    }

    pub fn alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Default queue depth for a connected viewer's outgoing packet buffer.
pub const VIEWER_QUEUE_CAPACITY: usize = 1024;
/// Default queue depth for the HLS repackager's incoming packet buffer.
pub const HLS_QUEUE_CAPACITY: usize = 512;

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use ripplecast_protocol::PacketHeader;

    use super::*;

    fn packet() -> Packet {
        Packet {
            is_video: false,
            is_audio: false,
            is_metadata: true,
            timestamp: 0,
            stream_id: 1,
            header: PacketHeader::Metadata,
            data: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn writer_delivers_to_reader() {
        let (tx, mut rx) = channel("test", 4);
        tx.write(packet());
        let received = rx.read().await;
        assert!(received.is_some());
    }

    #[tokio::test]
    async fn full_queue_drops_newest_without_blocking() {
        let (tx, mut rx) = channel("test", 1);
        tx.write(packet());
        tx.write(packet()); // dropped, queue already holds one
        assert!(rx.read().await.is_some());

        // Queue should now be empty; a fresh write should succeed again.
        tx.write(packet());
        assert!(rx.read().await.is_some());
    }

    #[tokio::test]
    async fn alive_within_reflects_recent_writes() {
        let (tx, mut rx) = channel("test", 4);
        assert!(tx.alive_within(Duration::from_millis(50)));
        tx.write(packet());
        rx.read().await;
        assert!(tx.alive_within(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_delivery() {
        let (tx, mut rx) = channel("test", 4);
        tx.close();
        tx.close();
        assert!(!tx.alive());
        tx.write(packet());
        assert!(rx.read().await.is_none());
    }
}
