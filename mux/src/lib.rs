//! MPEG-TS packaging for the HLS repackager: PSI tables, PES framing,
//! and the CRC-32/MPEG-2 checksum PSI sections carry.

pub mod crc;
pub mod ts;

pub use crc::crc32_mpeg2;
pub use ts::{AudioCodec, StreamKind, TsMuxer, AUDIO_PID, PACKET_SIZE, PAT_PID, PMT_PID, VIDEO_PID};
