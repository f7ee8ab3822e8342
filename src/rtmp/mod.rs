//! RTMP 1.0 server: chunk transport, handshake, command negotiation, the
//! stream fan-out, and the accept loop that ties them together.

pub(crate) mod cache;
pub(crate) mod chunk_stream;
pub(crate) mod conn;
pub(crate) mod conn_server;
pub(crate) mod handshake;
mod server;
mod stream;
pub(crate) mod vir;

pub use server::RtmpServer;
pub use stream::{Registry, Stream};
