use derive_more::{Display, From};
use ripplecast_codec::{AacError, AvcError};

/// Errors surfaced by the HLS repackager. Per the propagation policy,
/// only `SourceClosed` ever reaches a caller synchronously — codec
/// errors are logged by the worker and drop the offending packet rather
/// than closing the pipeline.
#[derive(Debug, Display, From)]
pub enum HlsError {
    #[display(fmt = "hls source is closed")]
    SourceClosed,
    #[display(fmt = "unsupported video codec id {_0}")]
    UnsupportedVideoCodec(u8),
    #[display(fmt = "unsupported audio format id {_0}")]
    UnsupportedAudioFormat(u8),
    #[display(fmt = "h.264 parse error: {_0}")]
    Avc(AvcError),
    #[display(fmt = "aac parse error: {_0}")]
    Aac(AacError),
}

impl std::error::Error for HlsError {}
