//! The segment cache: a bounded ring of [`Item`]s the HLS repackager
//! writes into and an external (unspecified) HTTP delivery layer reads
//! from. An `Item` is append-only while open and immutable once closed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Queue depth for an `Item`'s late-subscriber fan-out: enough to absorb
/// a burst of TS packets between a subscriber's polls without ever
/// blocking the producer.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// One HLS media segment. Created empty by a [`SegmentCache`], written
/// to once by the repackager as TS packets are produced, and closed on
/// a cut. After `close`, the byte buffer never changes again.
pub struct Item {
    pub name: String,
    pub seq_num: u64,
    pub start_time: Instant,
    buffer: Mutex<BytesMut>,
    duration_millis: AtomicU64,
    closed: AtomicBool,
    subscribers: broadcast::Sender<Bytes>,
}

impl Item {
    fn new(name: String, seq_num: u64) -> Arc<Self> {
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        Arc::new(Item {
            name,
            seq_num,
            start_time: Instant::now(),
            buffer: Mutex::new(BytesMut::new()),
            duration_millis: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            subscribers,
        })
    }

    /// Appends `chunk` to the segment and fans it out to any subscriber
    /// currently attached. A write after `close` is a no-op: callers are
    /// expected to request a fresh `Item` from the cache instead.
    pub fn write(&self, chunk: Bytes) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.buffer.lock().extend_from_slice(&chunk);
        let _ = self.subscribers.send(chunk);
    }

    /// Finalizes the segment at the given duration. Idempotent.
    pub fn close(&self, duration: Duration) {
        self.duration_millis.store(duration.as_millis() as u64, Ordering::Release);
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_millis.load(Ordering::Acquire))
    }

    /// A snapshot of everything written so far.
    pub fn bytes(&self) -> Bytes {
        self.buffer.lock().clone().freeze()
    }

    /// Subscribes to this segment's live byte stream. Returns a snapshot
    /// of everything written before the subscription plus a receiver for
    /// everything written after — a late subscriber never misses a byte
    /// and never sees one twice.
    pub fn subscribe(&self) -> (Bytes, broadcast::Receiver<Bytes>) {
        let rx = self.subscribers.subscribe();
        (self.bytes(), rx)
    }
}

/// A bounded ring of `Item`s. `new_item` evicts the oldest item once the
/// ring is at capacity; `get` looks an item up by the opaque id `new_item`
/// handed back. Every item returned by `get` is either still in the
/// window or was in it at call entry — callers may race with eviction,
/// but the item itself stays valid (and immutable, once closed) for as
/// long as any `Arc` to it survives.
pub struct SegmentCache {
    capacity: usize,
    items: Mutex<VecDeque<Arc<Item>>>,
    by_name: Mutex<HashMap<String, Arc<Item>>>,
    next_seq: AtomicU64,
}

impl SegmentCache {
    pub fn new(capacity: usize) -> Self {
        SegmentCache {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            by_name: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn new_item(&self) -> Arc<Item> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("seg-{seq}");
        let item = Item::new(name.clone(), seq);

        let mut items = self.items.lock();
        items.push_back(item.clone());
        if items.len() > self.capacity {
            if let Some(evicted) = items.pop_front() {
                self.by_name.lock().remove(&evicted.name);
            }
        }
        drop(items);

        self.by_name.lock().insert(name, item.clone());
        item
    }

    pub fn get(&self, name: &str) -> Option<Arc<Item>> {
        self.by_name.lock().get(name).cloned()
    }

    /// The current window, oldest first.
    pub fn items(&self) -> Vec<Arc<Item>> {
        self.items.lock().iter().cloned().collect()
    }
}

impl Default for SegmentCache {
    fn default() -> Self {
        SegmentCache::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_evicts_the_oldest_once_full() {
        let cache = SegmentCache::new(2);
        let first = cache.new_item();
        let _second = cache.new_item();
        let _third = cache.new_item();

        assert!(cache.get(&first.name).is_none());
        assert_eq!(cache.items().len(), 2);
    }

    #[test]
    fn get_finds_an_item_still_in_the_window() {
        let cache = SegmentCache::new(10);
        let item = cache.new_item();
        assert!(cache.get(&item.name).is_some());
    }

    #[test]
    fn write_after_close_is_a_no_op() {
        let cache = SegmentCache::new(10);
        let item = cache.new_item();
        item.write(Bytes::from_static(b"abc"));
        item.close(Duration::from_millis(500));
        item.write(Bytes::from_static(b"def"));
        assert_eq!(item.bytes(), Bytes::from_static(b"abc"));
        assert_eq!(item.duration(), Duration::from_millis(500));
    }

    #[test]
    fn late_subscriber_gets_a_snapshot_then_live_chunks() {
        let item = Item::new("seg-0".to_owned(), 0);
        item.write(Bytes::from_static(b"abc"));
        let (snapshot, mut rx) = item.subscribe();
        assert_eq!(snapshot, Bytes::from_static(b"abc"));

        item.write(Bytes::from_static(b"def"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"def"));
    }
}
