//! Elementary stream parsers shared by the RTMP ingest path and the HLS
//! repackager: H.264 AVCC/Annex-B conversion and AAC ADTS framing.

pub mod aac;
pub mod avc;

pub use aac::{AacError, AudioSpecificConfig, Parser as AacParser};
pub use avc::{AvcError, Parser as AvcParser};
