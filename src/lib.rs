//! An RTMP 1.0 ingest server with an attached HLS (MPEG-TS) repackager.
//!
//! A caller implements [`RtmpHandler`] to authenticate publishers and
//! viewers and to observe connection lifecycle events, then runs
//! [`RtmpServer::run`]. Each published stream can additionally be
//! repackaged into a rolling cache of `.ts` segments via [`hls::Source`],
//! attached to the same fan-out [`rtmp::Registry`] a publisher's packets
//! flow through.

mod byteio;
mod config;
mod error;
mod flv;
pub mod hls;
mod rtmp;

pub use config::{HlsConfig, PermissiveHandler, RtmpHandler, RtmpServerConfig};
pub use error::RtmpError;
pub use hls::HlsError;
pub use rtmp::{Registry, RtmpServer, Stream};

pub use ripplecast_protocol::{Info, Packet};
