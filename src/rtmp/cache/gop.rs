//! The rolling group-of-pictures cache: everything since the last
//! key-frame, so a viewer attaching mid-stream can start decoding
//! immediately instead of waiting for the next key-frame.

use ripplecast_protocol::Packet;

use crate::error::RtmpError;

/// Packets retained per bucket before a write is rejected as overflow.
pub const MAX_GOP_LENGTH: usize = 1024;

/// Two buckets so the bucket being drained by a newly-attaching viewer is
/// never the one a concurrent key-frame swap clears; in practice the
/// fan-out clones packets out before any swap, but keeping two avoids an
/// allocation on every key-frame regardless.
#[derive(Debug)]
pub struct GopCache {
    buckets: [Vec<Packet>; 2],
    active: usize,
}

impl Default for GopCache {
    fn default() -> Self {
        GopCache::new()
    }
}

impl GopCache {
    pub fn new() -> Self {
        GopCache {
            buckets: [Vec::new(), Vec::new()],
            active: 0,
        }
    }

    /// Routes a non-special video/audio packet into the current GOP
    /// bucket, starting a fresh one on a key-frame. Returns an error once
    /// a single GOP exceeds [`MAX_GOP_LENGTH`] packets, which the
    /// publisher loop surfaces and treats as a fatal stream error.
    pub fn write(&mut self, packet: Packet) -> Result<(), RtmpError> {
        if packet.is_key_frame() {
            let next = 1 - self.active;
            self.buckets[next].clear();
            self.buckets[next].push(packet);
            self.active = next;
            return Ok(());
        }

        let bucket = &mut self.buckets[self.active];
        if bucket.is_empty() {
            // No key-frame has started a bucket yet; nothing to append to.
            return Ok(());
        }
        if bucket.len() >= MAX_GOP_LENGTH {
            return Err(RtmpError::GopOverflow);
        }
        bucket.push(packet);
        Ok(())
    }

    pub fn packets(&self) -> &[Packet] {
        &self.buckets[self.active]
    }
}
