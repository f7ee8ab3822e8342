//! The HLS repackager: turns one stream's ingested FLV packets into a
//! rolling cache of MPEG-TS segments. [`Source`] is the attach point —
//! it looks like just another `Stream` writer to the RTMP fan-out.

mod align;
mod audio;
mod error;
mod segment;
mod source;

pub use error::HlsError;
pub use segment::{Item, SegmentCache};
pub use source::Source;
