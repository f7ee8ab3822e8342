//! Aggregates AAC frames before handing them to the TS muxer: FLV/RTMP
//! delivers one ADTS-worth of audio per RTMP message, which would mean
//! one PES (and up to 7 TS packets) per ~23ms of audio. Buffering a
//! handful of frames per PES cuts that overhead by roughly 6x.

use bytes::{Bytes, BytesMut};

/// Frames buffered before a drain is forced.
pub const MAX_BUFFERED_FRAMES: usize = 6;

#[derive(Debug, Default)]
pub struct AudioAggregator {
    frames: BytesMut,
    first_pts_90k: Option<u64>,
    count: usize,
}

impl AudioAggregator {
    pub fn new() -> Self {
        AudioAggregator::default()
    }

    /// Buffers one ADTS-framed AAC frame at the given 90kHz PTS. Returns
    /// the aggregated `(pts, bytes)` once [`MAX_BUFFERED_FRAMES`] frames
    /// have accumulated.
    pub fn push(&mut self, pts_90k: u64, adts_frame: &[u8]) -> Option<(u64, Bytes)> {
        if self.count == 0 {
            self.first_pts_90k = Some(pts_90k);
        }
        self.frames.extend_from_slice(adts_frame);
        self.count += 1;

        if self.count >= MAX_BUFFERED_FRAMES {
            self.drain()
        } else {
            None
        }
    }

    /// Drains whatever is buffered, regardless of count. Used on segment
    /// cut and on source close so no audio is lost at a boundary.
    pub fn flush(&mut self) -> Option<(u64, Bytes)> {
        if self.count == 0 {
            None
        } else {
            self.drain()
        }
    }

    fn drain(&mut self) -> Option<(u64, Bytes)> {
        let pts = self.first_pts_90k.take()?;
        self.count = 0;
        Some((pts, std::mem::take(&mut self.frames).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_after_six_frames_with_the_first_frames_pts() {
        let mut agg = AudioAggregator::new();
        for i in 0..5 {
            assert!(agg.push(i * 1000, &[0xaa]).is_none());
        }
        let (pts, bytes) = agg.push(5000, &[0xaa]).unwrap();
        assert_eq!(pts, 0);
        assert_eq!(bytes.len(), 6);
    }

    #[test]
    fn flush_drains_a_partial_buffer() {
        let mut agg = AudioAggregator::new();
        agg.push(100, &[0x01, 0x02]);
        agg.push(200, &[0x03]);
        let (pts, bytes) = agg.flush().unwrap();
        assert_eq!(pts, 100);
        assert_eq!(bytes.as_ref(), &[0x01, 0x02, 0x03]);
        assert!(agg.flush().is_none());
    }
}
