//! Shared wire-level types used by both the RTMP transport and the HLS
//! repackager: the universal `Packet`, stream `Info`, and the AMF0 codec.

mod amf0;
mod info;
mod packet;

pub use amf0::{
    decode_batch, decode_value, encode_command, encode_value, reform_metadata, Amf0Error, MetaDataMode,
    Object, Value, SET_DATA_FRAME,
};
pub use info::Info;
pub use packet::{
    AudioHeader, Packet, PacketHeader, VideoHeader, AAC_RAW, AAC_SEQUENCE_HEADER, FRAME_INTER, FRAME_KEY,
    SOUND_AAC, SOUND_MP3, TAG_AUDIO, TAG_SCRIPT_DATA_AMF0, TAG_SCRIPT_DATA_AMF3, TAG_VIDEO, VIDEO_H264,
};
