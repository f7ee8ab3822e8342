//! The priming cache attached to every published stream: the packets a
//! newly attached viewer needs replayed before it starts receiving the
//! live feed, so it can decode immediately instead of waiting for the
//! next key-frame and sequence headers.

mod gop;
mod special;

pub use gop::{GopCache, MAX_GOP_LENGTH};
pub use special::SpecialCache;

use ripplecast_protocol::Packet;

use crate::error::RtmpError;

#[derive(Debug, Default)]
pub struct Cache {
    special: SpecialCache,
    gop: GopCache,
}

impl Cache {
    pub fn new() -> Self {
        Cache::default()
    }

    /// Classifies and stores one packet from the publisher. Metadata and
    /// sequence headers land in the special slots; every other
    /// audio/video packet joins the rolling GOP bucket.
    pub fn write(&mut self, packet: Packet) -> Result<(), RtmpError> {
        if self.special.write(&packet) {
            return Ok(());
        }
        self.gop.write(packet)
    }

    /// The full priming sequence for a newly attached viewer, in
    /// delivery order: metadata, video sequence header, audio sequence
    /// header, then the current GOP.
    pub fn priming(&self) -> impl Iterator<Item = &Packet> {
        self.special.priming().chain(self.gop.packets().iter())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use ripplecast_protocol::{PacketHeader, VideoHeader};

    use super::*;

    fn key_frame() -> Packet {
        Packet {
            is_video: true,
            is_audio: false,
            is_metadata: false,
            timestamp: 0,
            stream_id: 1,
            header: PacketHeader::Video(VideoHeader {
                codec_id: ripplecast_protocol::VIDEO_H264,
                is_seq: false,
                is_key_frame: true,
                composition_time: 0,
            }),
            data: Bytes::from_static(&[0u8]),
        }
    }

    fn metadata_packet() -> Packet {
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

    #[test]
    fn priming_order_is_metadata_then_gop() {
        let mut cache = Cache::new();
        cache.write(metadata_packet()).unwrap();
        cache.write(key_frame()).unwrap();

        let primed: Vec<&Packet> = cache.priming().collect();
        assert_eq!(primed.len(), 2);
        assert!(primed[0].is_metadata);
        assert!(primed[1].is_key_frame());
    }
}
