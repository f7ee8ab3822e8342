//! The stream fan-out: one publisher's packets cloned out to every
//! attached viewer, with a priming cache so a viewer that attaches
//! mid-broadcast can start decoding immediately. One [`Stream`] exists
//! per (app, name) key, tracked by the [`Registry`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ripplecast_protocol::Packet;
use uuid::Uuid;

use super::cache::Cache;
use super::vir::{self, VirReader, VirWriter, DEFAULT_MAX_IDLE, VIEWER_QUEUE_CAPACITY};

/// Interval of the registry's dead-entry sweep (§5: "every 5 seconds").
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

struct ViewerSlot {
    writer: VirWriter,
    /// Whether this viewer has received its priming sequence yet.
    primed: bool,
}

#[derive(Default)]
struct Inner {
    cache: Cache,
    viewers: HashMap<Uuid, ViewerSlot>,
}

/// One (app, name) stream: a publisher's packets fanned out to whatever
/// viewers are attached, primed with metadata + sequence headers + the
/// current GOP on first delivery.
pub struct Stream {
    app: String,
    name: String,
    publisher_alive: AtomicBool,
    inner: Mutex<Inner>,
}

impl Stream {
    fn new(app: String, name: String) -> Arc<Self> {
        Arc::new(Stream {
            app,
            name,
            publisher_alive: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
        })
    }

    fn label(&self) -> String {
        format!("{}/{}", self.app, self.name)
    }

    /// Spawns the task that drains `reader`'s packets into the priming
    /// cache and out to every viewer, preserving publisher order.
    pub fn attach_publisher(self: &Arc<Self>, reader: VirReader) {
        self.publisher_alive.store(true, Ordering::Release);
        let stream = self.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            while let Some(packet) = reader.read().await {
                stream.ingest(packet);
            }
            stream.publisher_alive.store(false, Ordering::Release);
        });
    }

    /// Registers a new viewer and returns the reader it should drain.
    /// The viewer receives the full priming sequence before its first
    /// live packet, whenever the next packet is ingested.
    pub fn attach_viewer(&self) -> VirReader {
        let (writer, reader) = vir::channel(format!("viewer:{}", self.label()), VIEWER_QUEUE_CAPACITY);
        self.inner.lock().viewers.insert(Uuid::new_v4(), ViewerSlot { writer, primed: false });
        reader
    }

    fn ingest(&self, packet: Packet) {
        let mut inner = self.inner.lock();
        let live = packet.clone();

        if let Err(err) = inner.cache.write(packet) {
            log::warn!("{}: {err}", self.label());
        }

        let needs_priming = inner.viewers.values().any(|slot| !slot.primed);
        let priming: Vec<Packet> = if needs_priming {
            inner.cache.priming().cloned().collect()
        } else {
            Vec::new()
        };

        inner.viewers.retain(|_, slot| {
            if !slot.primed {
                for p in &priming {
                    slot.writer.write(p.clone());
                }
                slot.primed = true;
            } else {
                slot.writer.write(live.clone());
            }
            slot.writer.alive()
        });
    }

    /// Drops viewers that have gone quiet past [`DEFAULT_MAX_IDLE`].
    fn sweep(&self) {
        self.inner.lock().viewers.retain(|_, slot| slot.writer.alive_within(DEFAULT_MAX_IDLE));
    }

    /// No publisher and no viewers left: safe for the registry to drop.
    fn is_empty(&self) -> bool {
        !self.publisher_alive.load(Ordering::Acquire) && self.inner.lock().viewers.is_empty()
    }
}

/// Process-wide table of live streams keyed by (app, name), with a
/// background sweep that garbage-collects empty ones.
pub struct Registry {
    streams: Mutex<HashMap<(String, String), Arc<Stream>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Registry {
            streams: Mutex::new(HashMap::new()),
        });
        registry.clone().spawn_sweeper();
        registry
    }

    /// Looks up or lazily creates the `Stream` for (app, name). A viewer
    /// may attach before any publisher exists; it simply receives an
    /// empty priming cache until one does.
    pub fn get_or_create(&self, app: &str, name: &str) -> Arc<Stream> {
        self.streams
            .lock()
            .entry((app.to_owned(), name.to_owned()))
            .or_insert_with(|| Stream::new(app.to_owned(), name.to_owned()))
            .clone()
    }

    pub fn get(&self, app: &str, name: &str) -> Option<Arc<Stream>> {
        self.streams.lock().get(&(app.to_owned(), name.to_owned())).cloned()
    }

    fn spawn_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let mut streams = self.streams.lock();
                for stream in streams.values() {
                    stream.sweep();
                }
                streams.retain(|_, stream| !stream.is_empty());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use ripplecast_protocol::{PacketHeader, VideoHeader};

    use super::*;

    fn key_frame_at(timestamp: u32) -> Packet {
        Packet {
            is_video: true,
            is_audio: false,
            is_metadata: false,
            timestamp,
            stream_id: 1,
            header: PacketHeader::Video(VideoHeader {
                codec_id: ripplecast_protocol::VIDEO_H264,
                is_seq: false,
                is_key_frame: true,
                composition_time: 0,
            }),
            data: Bytes::from_static(&[0xaa]),
        }
    }

    fn key_frame() -> Packet {
        key_frame_at(0)
    }

    #[tokio::test]
    async fn viewer_attached_before_publisher_gets_empty_priming_then_live_packets() {
        let stream = Stream::new("live".to_owned(), "room1".to_owned());
        let mut viewer = stream.attach_viewer();

        stream.ingest(key_frame());
        let received = viewer.read().await.unwrap();
        assert!(received.is_key_frame());
    }

    #[tokio::test]
    async fn late_viewer_is_primed_before_the_next_live_packet() {
        let stream = Stream::new("live".to_owned(), "room1".to_owned());
        stream.ingest(key_frame_at(0));

        let mut viewer = stream.attach_viewer();
        stream.ingest(key_frame_at(1));

        // First delivery to a freshly attached viewer is the priming
        // sequence (here, just the GOP so far, already including the
        // packet that triggered priming), then nothing else for that
        // same ingest — not a duplicate of the just-primed packet.
        let first = viewer.read().await.unwrap();
        assert_eq!(first.timestamp, 1);
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), viewer.read())
            .await
            .is_err();
        assert!(timed_out, "viewer should not receive the just-primed packet a second time");
    }

    #[test]
    fn empty_stream_with_no_publisher_or_viewers_is_empty() {
        let stream = Stream::new("live".to_owned(), "room1".to_owned());
        assert!(stream.is_empty());
    }
}
