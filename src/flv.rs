//! FLV tag parsing: the demuxing step that turns one already-framed RTMP
//! audio/video/data message into the universal [`Packet`], extracting the
//! codec-specific header fields FLV packs into the first few payload
//! bytes and leaving `data` holding only the codec payload (an
//! AVCDecoderConfigurationRecord/AVCC sample, an AudioSpecificConfig/raw
//! AAC frame, or an untouched script-data blob).

use bytes::Bytes;
use derive_more::{Display, From};
use ripplecast_protocol::{
    reform_metadata, AudioHeader, MetaDataMode, Packet, PacketHeader, VideoHeader, AAC_RAW, AAC_SEQUENCE_HEADER,
    SOUND_AAC, TAG_AUDIO, TAG_SCRIPT_DATA_AMF0, TAG_SCRIPT_DATA_AMF3, TAG_VIDEO, VIDEO_H264,
};

use crate::rtmp::conn::Message;

#[derive(Debug, Display, From)]
pub enum FlvError {
    #[display(fmt = "flv: video tag body is empty")]
    EmptyVideoTag,
    #[display(fmt = "flv: audio tag body is empty")]
    EmptyAudioTag,
    #[display(fmt = "flv: unsupported video codec id {_0}")]
    UnsupportedVideoCodec(u8),
    #[display(fmt = "flv: message type id {_0} is not audio, video, or script data")]
    UnsupportedTag(u8),
}

impl std::error::Error for FlvError {}

/// FLV `SoundRate` nibble -> Hz, used only for non-AAC formats (AAC's
/// actual rate comes from its own `AudioSpecificConfig`).
const FLV_SOUND_RATES: [u32; 4] = [5512, 11025, 22050, 44100];

/// Demuxes one RTMP message into a [`Packet`]. `type_id` selects between
/// the audio, video, and script-data (`onMetaData`) tag layouts; any
/// other type id is not a payload this layer understands.
pub fn tag_to_packet(msg: &Message) -> Result<Packet, FlvError> {
    match msg.type_id {
        TAG_VIDEO => video_packet(&msg.data, msg.timestamp, msg.stream_id),
        TAG_AUDIO => audio_packet(&msg.data, msg.timestamp, msg.stream_id),
        TAG_SCRIPT_DATA_AMF0 | TAG_SCRIPT_DATA_AMF3 => {
            Ok(metadata_packet(strip_set_data_frame(&msg.data), msg.timestamp, msg.stream_id))
        }
        other => Err(FlvError::UnsupportedTag(other)),
    }
}

/// Parses an FLV `VIDEODATA` tag body: `frameType(4)|codecId(4)`, then
/// for AVC, `AVCPacketType(1) + compositionTime(i24)` before the payload.
fn video_packet(data: &Bytes, timestamp: u32, stream_id: u32) -> Result<Packet, FlvError> {
    if data.is_empty() {
        return Err(FlvError::EmptyVideoTag);
    }

    let frame_type = data[0] >> 4;
    let codec_id = data[0] & 0x0f;

    if codec_id != VIDEO_H264 {
        return Err(FlvError::UnsupportedVideoCodec(codec_id));
    }
    if data.len() < 5 {
        return Err(FlvError::EmptyVideoTag);
    }

    let avc_packet_type = data[1];
    let composition_time = read_i24(&data[2..5]);

    Ok(Packet {
        is_video: true,
        is_audio: false,
        is_metadata: false,
        timestamp,
        stream_id,
        header: PacketHeader::Video(VideoHeader {
            codec_id,
            is_seq: avc_packet_type == 0,
            is_key_frame: frame_type == ripplecast_protocol::FRAME_KEY,
            composition_time,
        }),
        data: data.slice(5..),
    })
}

/// Parses an FLV `AUDIODATA` tag body:
/// `soundFormat(4)|soundRate(2)|soundSize(1)|soundType(1)`, then for AAC,
/// `AACPacketType(1)` before the payload.
fn audio_packet(data: &Bytes, timestamp: u32, stream_id: u32) -> Result<Packet, FlvError> {
    if data.is_empty() {
        return Err(FlvError::EmptyAudioTag);
    }

    let sound_format = data[0] >> 4;
    let sound_rate_idx = (data[0] >> 2) & 0x03;
    let sound_type = data[0] & 0x01;
    let channels = if sound_type == 1 { 2 } else { 1 };

    if sound_format == SOUND_AAC {
        if data.len() < 2 {
            return Err(FlvError::EmptyAudioTag);
        }
        let aac_packet_type = data[1];
        Ok(Packet {
            is_video: false,
            is_audio: true,
            is_metadata: false,
            timestamp,
            stream_id,
            header: PacketHeader::Audio(AudioHeader {
                sound_format,
                aac_packet_type,
                // populated once the AAC sequence header is parsed; until
                // then this is a placeholder the HLS pipeline ignores for
                // anything but AAC_RAW.
                sample_rate: FLV_SOUND_RATES[sound_rate_idx as usize],
                channels,
            }),
            data: data.slice(2..),
        })
    } else {
        Ok(Packet {
            is_video: false,
            is_audio: true,
            is_metadata: false,
            timestamp,
            stream_id,
            header: PacketHeader::Audio(AudioHeader {
                sound_format,
                aac_packet_type: AAC_RAW,
                sample_rate: FLV_SOUND_RATES[sound_rate_idx as usize],
                channels,
            }),
            data: data.slice(1..),
        })
    }
}

/// Publishers commonly prefix `onMetaData` with an `@setDataFrame`
/// marker that exists only to tell the server which stream the command
/// updates; it isn't meaningful to a viewer, so it's dropped before the
/// packet enters the priming cache or the HLS pipeline. Malformed script
/// data is passed through unchanged rather than dropped.
fn strip_set_data_frame(data: &Bytes) -> Bytes {
    reform_metadata(data, MetaDataMode::Del).unwrap_or_else(|_| data.clone())
}

fn metadata_packet(data: Bytes, timestamp: u32, stream_id: u32) -> Packet {
    Packet {
        is_video: false,
        is_audio: false,
        is_metadata: true,
        timestamp,
        stream_id,
        header: PacketHeader::Metadata,
        data,
    }
}

fn read_i24(b: &[u8]) -> i32 {
    let u = ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | (b[2] as u32);
    if u & 0x0080_0000 != 0 {
        (u | 0xff00_0000) as i32
    } else {
        u as i32
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn msg(type_id: u8, data: Vec<u8>) -> Message {
        Message {
            type_id,
            stream_id: 1,
            timestamp: 1234,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn parses_an_avc_sequence_header_tag() {
        let body = vec![0x17, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03];
        let packet = tag_to_packet(&msg(TAG_VIDEO, body)).unwrap();
        assert!(packet.is_video);
        let header = packet.video_header().unwrap();
        assert!(header.is_seq);
        assert!(header.is_key_frame);
        assert_eq!(packet.data.as_ref(), &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn negative_composition_time_is_sign_extended() {
        // AVCPacketType=1 (NALU), composition time = -1 (0xFFFFFF).
        let body = vec![0x27, 0x01, 0xff, 0xff, 0xff, 0xaa];
        let packet = tag_to_packet(&msg(TAG_VIDEO, body)).unwrap();
        assert_eq!(packet.video_header().unwrap().composition_time, -1);
    }

    #[test]
    fn rejects_non_avc_video_codec() {
        let body = vec![0x12, 0, 0, 0, 0]; // codec id 2 (Sorenson H.263)
        assert!(matches!(tag_to_packet(&msg(TAG_VIDEO, body)), Err(FlvError::UnsupportedVideoCodec(2))));
    }

    #[test]
    fn parses_an_aac_sequence_header_tag() {
        let body = vec![0xaf, 0x00, 0x12, 0x10];
        let packet = tag_to_packet(&msg(TAG_AUDIO, body)).unwrap();
        assert!(packet.is_audio);
        assert_eq!(packet.audio_header().unwrap().aac_packet_type, AAC_SEQUENCE_HEADER);
        assert_eq!(packet.data.as_ref(), &[0x12, 0x10]);
    }

    #[test]
    fn script_data_passes_through_untouched() {
        let body = vec![1, 2, 3, 4];
        let packet = tag_to_packet(&msg(TAG_SCRIPT_DATA_AMF0, body.clone())).unwrap();
        assert!(packet.is_metadata);
        assert_eq!(packet.data.as_ref(), &body[..]);
    }
}
