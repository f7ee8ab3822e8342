use std::io;

use derive_more::{Display, From};
use ripplecast_protocol::Amf0Error;

use crate::rtmp::chunk_stream::ChunkError;
use crate::rtmp::handshake::HandshakeError;

/// Top-level error for one RTMP connection. Any variant closes the
/// connection; there is no recoverable case at this layer (codec-level
/// errors in the HLS pipeline use `hls::HlsError` instead, and do not
/// propagate here).
#[derive(Debug, Display, From)]
pub enum RtmpError {
    #[display(fmt = "io error: {_0}")]
    Io(io::Error),
    #[display(fmt = "handshake failed: {_0}")]
    Handshake(HandshakeError),
    #[display(fmt = "chunk stream error: {_0}")]
    Chunk(ChunkError),
    #[display(fmt = "amf0 error: {_0}")]
    Amf0(Amf0Error),
    #[display(fmt = "connect transaction id must be 1, got {_0}")]
    BadConnectTxnId(f64),
    #[display(fmt = "command missing required field {_0:?}")]
    MissingField(&'static str),
    #[display(fmt = "already authenticated")]
    AlreadyAuthed,
    #[display(fmt = "authentication rejected")]
    AuthRejected,
    #[display(fmt = "authentication callback timed out")]
    AuthTimeout,
    #[display(fmt = "unsupported video codec id {_0}")]
    UnsupportedVideoCodec(u8),
    #[display(fmt = "unsupported audio format id {_0}")]
    UnsupportedAudioFormat(u8),
    #[display(fmt = "stream fan-out is closed")]
    StreamClosed,
    #[display(fmt = "gop cache overflowed its 1024-packet bucket")]
    GopOverflow,
}

impl std::error::Error for RtmpError {}
