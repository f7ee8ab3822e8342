//! Configuration and the pluggable auth/lifecycle callbacks a caller
//! wires in around the RTMP server and HLS pipeline.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use ripplecast_protocol::Info;

use crate::error::RtmpError;

/// Lifecycle hooks an embedder implements to authenticate and observe
/// streams. Every method has a permissive default so a caller can
/// override only what it needs.
#[async_trait]
pub trait RtmpHandler: Send + Sync {
    /// Called right after the handshake, before any AMF command is
    /// processed. Returning `false` closes the connection immediately.
    async fn on_new_stream(&self, _addr: SocketAddr) -> bool {
        true
    }

    /// Called once, after `publish` or `play` names the stream.
    /// `info.key` may be rewritten (e.g. to an authoritative stream id);
    /// the rewritten value propagates to the stream fan-out and to
    /// `on_stream_close`. A second call for the same connection must
    /// return `false` without side effects to satisfy duplicate-auth
    /// semantics; the server enforces the "exactly once" invariant by
    /// tracking authentication state itself rather than relying on this
    /// callback being idempotent.
    async fn auth_stream(&self, _info: &mut Info, _addr: SocketAddr) -> bool {
        true
    }

    async fn on_stream_close(&self, _info: &Info, _addr: SocketAddr) {}

    /// Called once a publisher has been authenticated and registered
    /// with the stream fan-out, before its packets start flowing.
    async fn handle_publisher(&self, _info: &Info) {}

    /// Called once a viewer has been authenticated and attached to the
    /// stream fan-out, before priming packets are delivered.
    async fn handle_viewer(&self, _info: &Info) {}

    /// Receives every AMF command not otherwise handled by the built-in
    /// state machine (i.e. beyond connect/createStream/publish/play).
    /// Returning an error closes the connection.
    async fn handle_cmd_chunk(&self, _info: &Info, _values: &[ripplecast_protocol::Value]) -> Result<(), RtmpError> {
        Ok(())
    }
}

/// A handler with every hook at its default (permissive) behavior.
pub struct PermissiveHandler;

#[async_trait]
impl RtmpHandler for PermissiveHandler {}

#[derive(Debug, Clone)]
pub struct RtmpServerConfig {
    pub bind_addr: SocketAddr,
    pub auth_timeout: Duration,
}

impl Default for RtmpServerConfig {
    fn default() -> Self {
        RtmpServerConfig {
            bind_addr: "0.0.0.0:1935".parse().unwrap(),
            auth_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HlsConfig {
    pub min_segment_duration: Duration,
    pub cache_capacity: usize,
}

impl Default for HlsConfig {
    fn default() -> Self {
        HlsConfig {
            min_segment_duration: Duration::from_secs(1),
            cache_capacity: 10,
        }
    }
}
