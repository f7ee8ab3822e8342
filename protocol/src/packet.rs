use bytes::Bytes;

/// FLV tag type ids, as they appear on the wire in both RTMP chunks and FLV tags.
pub const TAG_AUDIO: u8 = 8;
pub const TAG_VIDEO: u8 = 9;
pub const TAG_SCRIPT_DATA_AMF0: u8 = 18;
pub const TAG_SCRIPT_DATA_AMF3: u8 = 0xf;

/// FLV `SoundFormat` nibble values we care about.
pub const SOUND_MP3: u8 = 2;
pub const SOUND_AAC: u8 = 10;

pub const AAC_SEQUENCE_HEADER: u8 = 0;
pub const AAC_RAW: u8 = 1;

pub const VIDEO_H264: u8 = 7;

pub const FRAME_KEY: u8 = 1;
pub const FRAME_INTER: u8 = 2;

/// Per-tag codec metadata. Exactly one packet ever carries `Metadata`,
/// the rest split along the video/audio line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHeader {
    Video(VideoHeader),
    Audio(AudioHeader),
    Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoHeader {
    pub codec_id: u8,
    pub is_seq: bool,
    pub is_key_frame: bool,
    pub composition_time: i32,
}

impl VideoHeader {
    pub fn frame_type(&self) -> u8 {
        if self.is_key_frame { FRAME_KEY } else { FRAME_INTER }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub sound_format: u8,
    pub aac_packet_type: u8,
    pub sample_rate: u32,
    pub channels: u8,
}

/// The universal AV unit passed between the RTMP fan-out and the HLS
/// repackager. Mirrors the FLV tag it was demuxed from.
#[derive(Debug, Clone)]
pub struct Packet {
    pub is_video: bool,
    pub is_audio: bool,
    pub is_metadata: bool,
    /// Decode timestamp, milliseconds.
    pub timestamp: u32,
    pub stream_id: u32,
    pub header: PacketHeader,
    pub data: Bytes,
}

impl Packet {
    pub fn video_header(&self) -> Option<VideoHeader> {
        match self.header {
            PacketHeader::Video(h) => Some(h),
            _ => None,
        }
    }

    pub fn audio_header(&self) -> Option<AudioHeader> {
        match self.header {
            PacketHeader::Audio(h) => Some(h),
            _ => None,
        }
    }

    pub fn is_key_frame(&self) -> bool {
        self.video_header().map(|h| h.is_key_frame).unwrap_or(false)
    }
}
