//! The RTMP listener: accepts TCP connections, drives each through the
//! handshake and command negotiation, then hands it off to the stream
//! fan-out as a publisher or a viewer. Owns graceful shutdown.
//!
//! A playback connection splits its socket once play begins: one task
//! drains the viewer's packet queue and writes to the socket, another
//! keeps reading it for the rare in-band command. Chunk (re)assembly
//! inside `Conn::read_message` fills its buffers in place as bytes
//! arrive, but isn't safe to race inside a `select!` — a cancelled read
//! can silently lose already-consumed socket bytes — so the two
//! directions run as two plain sequential loops instead of one racing
//! select.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use uuid::Uuid;

use ripplecast_protocol::{Info, Packet};

use crate::config::{RtmpHandler, RtmpServerConfig};
use crate::error::RtmpError;
use crate::flv;

use super::chunk_stream::{
    read_basic_header, write_basic_header, write_format0_header, write_format3_header, ChunkError, ChunkStream,
    DEFAULT_CHUNK_SIZE, TYPE_ABORT, TYPE_ACK, TYPE_AUDIO, TYPE_COMMAND_AMF0, TYPE_COMMAND_AMF3, TYPE_DATA_AMF0,
    TYPE_DATA_AMF3, TYPE_SET_CHUNK_SIZE, TYPE_USER_CONTROL, TYPE_VIDEO, TYPE_WINDOW_ACK_SIZE,
};
use super::conn::{Conn, Message, AUDIO_CSID, COMMAND_CSID, VIDEO_CSID};
use super::conn_server::{ConnServer, Intent};
use super::handshake::server_handshake;
use super::stream::Registry;
use super::vir::{self, VIEWER_QUEUE_CAPACITY};

/// Chunk size used for every outbound media message. Matches the value
/// `send_connect_preamble` negotiates at connect time.
const OUTBOUND_CHUNK_SIZE: u32 = 1024;

/// Decrements the in-flight publisher counter and wakes `wait_for_publishers`
/// on drop, however the connection task exits (normally or on error).
struct PublisherGuard {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for PublisherGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

/// The RTMP server: one TCP listener plus the stream registry every
/// accepted connection publishes into or reads from.
pub struct RtmpServer<H> {
    config: RtmpServerConfig,
    handler: Arc<H>,
    registry: Arc<Registry>,
    shutdown: Arc<AtomicBool>,
    shutdown_signal: Arc<Notify>,
    publisher_count: Arc<AtomicUsize>,
    publisher_idle: Arc<Notify>,
}

impl<H: RtmpHandler + 'static> RtmpServer<H> {
    pub fn new(config: RtmpServerConfig, handler: Arc<H>) -> Self {
        RtmpServer {
            config,
            handler,
            registry: Registry::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_signal: Arc::new(Notify::new()),
            publisher_count: Arc::new(AtomicUsize::new(0)),
            publisher_idle: Arc::new(Notify::new()),
        }
    }

    /// The stream fan-out every publisher's packets flow into. An
    /// embedder reaches a stream's `attach_viewer` from here to bridge
    /// its packets into an [`crate::hls::Source`], or into any other
    /// consumer, the same way a real RTMP viewer would.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Signals the accept loop to stop and wakes it if it is currently
    /// blocked in `accept()`. Idempotent.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_signal.notify_waiters();
    }

    /// Resolves once every publisher task that was running at the time
    /// of the call (or that started concurrently with it) has exited.
    pub async fn wait_for_publishers(&self) {
        while self.publisher_count.load(Ordering::Acquire) > 0 {
            self.publisher_idle.notified().await;
        }
    }

    /// Runs the accept loop until `request_shutdown` is called, then
    /// waits for in-flight publisher tasks before returning.
    pub async fn run(&self) -> Result<(), RtmpError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            tokio::select! {
                _ = self.shutdown_signal.notified() => break,
                accepted = listener.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            log::warn!("rtmp: accept error: {err}");
                            continue;
                        }
                    };

                    if self.shutdown.load(Ordering::Acquire) {
                        drop(socket);
                        continue;
                    }

                    self.spawn_connection(socket, addr);
                }
            }
        }

        self.wait_for_publishers().await;
        Ok(())
    }

    fn spawn_connection(&self, socket: tokio::net::TcpStream, addr: SocketAddr) {
        let handler = self.handler.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();
        let publisher_count = self.publisher_count.clone();
        let publisher_idle = self.publisher_idle.clone();

        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, addr, handler, registry, config, publisher_count, publisher_idle).await
            {
                log::debug!("rtmp: connection from {addr} closed: {err}");
            }
        });
    }
}

async fn handle_connection<H: RtmpHandler>(
    mut socket: tokio::net::TcpStream,
    addr: SocketAddr,
    handler: Arc<H>,
    registry: Arc<Registry>,
    config: RtmpServerConfig,
    publisher_count: Arc<AtomicUsize>,
    publisher_idle: Arc<Notify>,
) -> Result<(), RtmpError> {
    if !handler.on_new_stream(addr).await {
        return Ok(());
    }

    server_handshake(&mut socket).await?;

    let conn = Conn::new(socket);
    let mut conn_server = ConnServer::new(conn);

    let intent = conn_server.handshake_commands(|_values| {}).await?;

    match intent {
        Intent::Publish { name, .. } => {
            handle_publish(conn_server, addr, name, handler, registry, config, publisher_count, publisher_idle).await
        }
        Intent::Play { name } => handle_play(conn_server, addr, name, handler, registry, config).await,
    }
}

fn mint_info(publisher: bool, app: String, name: String, tc_url: &str) -> Info {
    let uid = Uuid::new_v4().to_string();
    Info {
        id: uid.clone(),
        key: uid,
        publisher,
        url: format!("{tc_url}/{name}"),
        name,
        app,
    }
}

async fn authenticate<H: RtmpHandler>(
    handler: &H,
    info: &mut Info,
    addr: SocketAddr,
    config: &RtmpServerConfig,
) -> Result<(), RtmpError> {
    match tokio::time::timeout(config.auth_timeout, handler.auth_stream(info, addr)).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(RtmpError::AuthRejected),
        Err(_) => Err(RtmpError::AuthTimeout),
    }
}

fn decode_command_values(msg: &Message) -> Result<Vec<ripplecast_protocol::Value>, RtmpError> {
    use std::io::Cursor;

    let body: &[u8] = if msg.type_id == TYPE_COMMAND_AMF3 {
        &msg.data[1.min(msg.data.len())..]
    } else {
        &msg.data[..]
    };
    Ok(ripplecast_protocol::decode_batch(&mut Cursor::new(body))?)
}

async fn handle_publish<H: RtmpHandler>(
    mut conn_server: ConnServer<tokio::net::TcpStream>,
    addr: SocketAddr,
    name: String,
    handler: Arc<H>,
    registry: Arc<Registry>,
    config: RtmpServerConfig,
    publisher_count: Arc<AtomicUsize>,
    publisher_idle: Arc<Notify>,
) -> Result<(), RtmpError> {
    let mut info = mint_info(true, conn_server.connect_info.app.clone(), name, &conn_server.connect_info.tc_url);
    authenticate(handler.as_ref(), &mut info, addr, &config).await?;

    conn_server.accept_publish().await?;
    handler.handle_publisher(&info).await;

    let stream = registry.get_or_create(&info.app, &info.name);
    let (packet_tx, packet_rx) = vir::channel(format!("publish:{}/{}", info.app, info.name), VIEWER_QUEUE_CAPACITY);
    stream.attach_publisher(packet_rx);

    publisher_count.fetch_add(1, Ordering::AcqRel);
    let _guard = PublisherGuard {
        count: publisher_count,
        notify: publisher_idle,
    };

    let mut conn = conn_server.into_conn();
    loop {
        let msg = match conn.read_message().await {
            Ok(msg) => msg,
            Err(_) => break,
        };

        match msg.type_id {
            TYPE_AUDIO | TYPE_VIDEO | TYPE_DATA_AMF0 | TYPE_DATA_AMF3 => match flv::tag_to_packet(&msg) {
                Ok(packet) => packet_tx.write(packet),
                Err(err) => log::debug!("rtmp: {}: {err}", info.url),
            },
            TYPE_COMMAND_AMF0 | TYPE_COMMAND_AMF3 => {
                let values = decode_command_values(&msg)?;
                handler.handle_cmd_chunk(&info, &values).await?;
            }
            _ => {}
        }
    }

    drop(packet_tx);
    handler.on_stream_close(&info, addr).await;
    Ok(())
}

async fn handle_play<H: RtmpHandler>(
    mut conn_server: ConnServer<tokio::net::TcpStream>,
    addr: SocketAddr,
    name: String,
    handler: Arc<H>,
    registry: Arc<Registry>,
    config: RtmpServerConfig,
) -> Result<(), RtmpError> {
    let mut info = mint_info(false, conn_server.connect_info.app.clone(), name, &conn_server.connect_info.tc_url);
    authenticate(handler.as_ref(), &mut info, addr, &config).await?;

    conn_server.accept_play().await?;
    handler.handle_viewer(&info).await;

    let stream = registry.get_or_create(&info.app, &info.name);
    let mut viewer = stream.attach_viewer();

    let socket = conn_server.into_conn().into_inner();
    let (mut read_half, mut write_half) = io::split(socket);

    let writer_url = info.url.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(packet) = viewer.read().await {
            let (csid, type_id) = classify_packet(&packet);
            let result =
                write_application_message(&mut write_half, csid, type_id, packet.stream_id, packet.timestamp, &packet.data)
                    .await;
            if let Err(err) = result {
                log::debug!("rtmp: {writer_url}: write error: {err}");
                break;
            }
        }
    });

    let mut chunk_streams = HashMap::new();
    let mut remote_chunk_size = DEFAULT_CHUNK_SIZE;

    loop {
        match read_application_message(&mut read_half, &mut chunk_streams, &mut remote_chunk_size).await {
            Ok(Some(msg)) if msg.type_id == TYPE_COMMAND_AMF0 || msg.type_id == TYPE_COMMAND_AMF3 => {
                let values = decode_command_values(&msg)?;
                handler.handle_cmd_chunk(&info, &values).await?;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    writer_task.abort();
    handler.on_stream_close(&info, addr).await;
    Ok(())
}

fn classify_packet(packet: &Packet) -> (u32, u8) {
    if packet.is_video {
        (VIDEO_CSID, TYPE_VIDEO)
    } else if packet.is_audio {
        (AUDIO_CSID, TYPE_AUDIO)
    } else {
        (COMMAND_CSID, TYPE_DATA_AMF0)
    }
}

/// Reads one already-framed message off a read-only half, or `None` for
/// a protocol control message the framer consumed internally. Mirrors
/// `Conn::read_message` but skips ack bookkeeping: a playback
/// connection's read side exists only to catch the rare in-band
/// command, not to police the peer's send window.
async fn read_application_message<R: AsyncRead + Unpin>(
    r: &mut R,
    chunk_streams: &mut HashMap<u32, ChunkStream>,
    remote_chunk_size: &mut u32,
) -> Result<Option<Message>, ChunkError> {
    let (format, csid) = read_basic_header(r).await?;
    let cs = chunk_streams.entry(csid).or_insert_with(|| ChunkStream::new(csid));

    cs.read_header(r, format).await?;
    cs.read_body(r, *remote_chunk_size).await?;

    if !cs.full() {
        return Ok(None);
    }

    let type_id = cs.type_id;
    let stream_id = cs.stream_id;
    let timestamp = cs.timestamp;
    let data = Bytes::from(std::mem::take(&mut cs.data));

    match type_id {
        TYPE_SET_CHUNK_SIZE if data.len() >= 4 => {
            *remote_chunk_size = u32::from_be_bytes(data[0..4].try_into().unwrap());
            Ok(None)
        }
        TYPE_ABORT | TYPE_ACK | TYPE_USER_CONTROL | TYPE_WINDOW_ACK_SIZE => Ok(None),
        _ => Ok(Some(Message {
            type_id,
            stream_id,
            timestamp,
            data,
        })),
    }
}

/// Writes one framed message to a write-only half at a fixed chunk
/// size. Mirrors `Conn::write_message`.
async fn write_application_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    csid: u32,
    type_id: u8,
    stream_id: u32,
    timestamp: u32,
    data: &[u8],
) -> Result<(), ChunkError> {
    write_basic_header(w, 0, csid).await?;
    write_format0_header(w, timestamp, data.len() as u32, type_id, stream_id).await?;

    let needs_extended = timestamp >= 0xff_ffff;
    let mut offset = 0usize;

    while offset < data.len() {
        let chunk_len = (data.len() - offset).min(OUTBOUND_CHUNK_SIZE as usize);
        w.write_all(&data[offset..offset + chunk_len]).await?;
        offset += chunk_len;

        if offset < data.len() {
            write_basic_header(w, 3, csid).await?;
            write_format3_header(w, timestamp, needs_extended).await?;
        }
    }

    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::PermissiveHandler;

    #[tokio::test]
    async fn wait_for_publishers_resolves_once_the_count_drops_to_zero() {
        let server = RtmpServer::new(RtmpServerConfig::default(), Arc::new(PermissiveHandler));
        server.publisher_count.store(1, Ordering::Release);

        let waiter = {
            let count = server.publisher_count.clone();
            let idle = server.publisher_idle.clone();
            tokio::spawn(async move {
                while count.load(Ordering::Acquire) > 0 {
                    idle.notified().await;
                }
            })
        };

        server.publisher_count.store(0, Ordering::Release);
        server.publisher_idle.notify_waiters();

        tokio::time::timeout(std::time::Duration::from_millis(200), waiter)
            .await
            .expect("wait_for_publishers should resolve promptly")
            .unwrap();
    }

    #[test]
    fn request_shutdown_is_idempotent() {
        let server = RtmpServer::new(RtmpServerConfig::default(), Arc::new(PermissiveHandler));
        server.request_shutdown();
        server.request_shutdown();
        assert!(server.shutdown.load(Ordering::Acquire));
    }
}
