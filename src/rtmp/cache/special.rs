//! The three "special" priming slots: the last `onMetaData`, the last
//! AAC sequence header, and the last H.264 sequence header. Each is
//! replaced in place as new ones arrive; only the latest of each kind is
//! ever retained.

use ripplecast_protocol::Packet;

#[derive(Debug, Default)]
pub struct SpecialCache {
    metadata: Option<Packet>,
    video_seq: Option<Packet>,
    audio_seq: Option<Packet>,
}

impl SpecialCache {
    pub fn new() -> Self {
        SpecialCache::default()
    }

    /// Stores `packet` if it belongs in one of the three special slots.
    /// Returns `true` if it was consumed here (the caller must not also
    /// route it into the GOP cache or forward it as a live packet before
    /// priming completes).
    pub fn write(&mut self, packet: &Packet) -> bool {
        if packet.is_metadata {
            self.metadata = Some(packet.clone());
            return true;
        }

        if packet.is_audio {
            if let Some(header) = packet.audio_header() {
                if header.aac_packet_type == ripplecast_protocol::AAC_SEQUENCE_HEADER {
                    self.audio_seq = Some(packet.clone());
                    return true;
                }
            }
            return false;
        }

        if packet.is_video {
            if let Some(header) = packet.video_header() {
                if header.is_seq {
                    self.video_seq = Some(packet.clone());
                    return true;
                }
            }
        }

        false
    }

    /// The priming sequence in delivery order: metadata, video sequence
    /// header, audio sequence header.
    pub fn priming(&self) -> impl Iterator<Item = &Packet> {
        [self.metadata.as_ref(), self.video_seq.as_ref(), self.audio_seq.as_ref()]
            .into_iter()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use ripplecast_protocol::{AudioHeader, PacketHeader, AAC_SEQUENCE_HEADER, SOUND_AAC};

    use super::*;

    fn audio_seq_packet() -> Packet {
        Packet {
            is_video: false,
            is_audio: true,
            is_metadata: false,
            timestamp: 0,
            stream_id: 1,
            header: PacketHeader::Audio(AudioHeader {
                sound_format: SOUND_AAC,
                aac_packet_type: AAC_SEQUENCE_HEADER,
                sample_rate: 44100,
                channels: 2,
            }),
            data: Bytes::new(),
        }
    }

    #[test]
    fn later_sequence_headers_replace_earlier_ones() {
        let mut cache = SpecialCache::new();
        assert!(cache.write(&audio_seq_packet()));
        assert!(cache.write(&audio_seq_packet()));
        assert_eq!(cache.priming().count(), 1);
    }
}
