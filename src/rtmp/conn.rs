//! Framed read/write of RTMP chunk streams on top of one TCP connection:
//! message (re)assembly, control-message handling, and the
//! acknowledgement window.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::chunk_stream::{
    read_basic_header, write_basic_header, write_format0_header, write_format3_header, ChunkError, ChunkStream,
    DEFAULT_CHUNK_SIZE, DEFAULT_WINDOW_ACK_SIZE, TYPE_ABORT, TYPE_ACK, TYPE_SET_CHUNK_SIZE, TYPE_SET_PEER_BANDWIDTH,
    TYPE_USER_CONTROL, TYPE_WINDOW_ACK_SIZE,
};

/// CSID used for protocol control messages (chunk size, window ack,
/// bandwidth, user control) and for the command channel.
pub const CONTROL_CSID: u32 = 2;
pub const COMMAND_CSID: u32 = 3;
pub const AUDIO_CSID: u32 = 4;
pub const VIDEO_CSID: u32 = 5;

const RECEIVED_WRAP_AT: u32 = 0xf000_0000;

/// A fully assembled RTMP message, ready for AMF/codec interpretation by
/// the layer above.
#[derive(Debug, Clone)]
pub struct Message {
    pub type_id: u8,
    pub stream_id: u32,
    pub timestamp: u32,
    pub data: Bytes,
}

pub struct Conn<S> {
    stream: S,
    chunk_streams: HashMap<u32, ChunkStream>,
    remote_chunk_size: u32,
    local_chunk_size: u32,
    remote_window_ack_size: u32,
    received: u32,
    last_ack: u32,
}

impl<S> Conn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Conn {
            stream,
            chunk_streams: HashMap::new(),
            remote_chunk_size: DEFAULT_CHUNK_SIZE,
            local_chunk_size: DEFAULT_CHUNK_SIZE,
            remote_window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            received: 0,
            last_ack: 0,
        }
    }

    /// Sends the standard post-handshake control-message trio.
    pub async fn send_connect_preamble(&mut self) -> Result<(), ChunkError> {
        self.send_window_ack_size(DEFAULT_WINDOW_ACK_SIZE).await?;
        self.send_set_peer_bandwidth(DEFAULT_WINDOW_ACK_SIZE, 2).await?;
        self.send_set_chunk_size(1024).await?;
        self.local_chunk_size = 1024;
        Ok(())
    }

    pub async fn send_window_ack_size(&mut self, size: u32) -> Result<(), ChunkError> {
        self.write_control_message(TYPE_WINDOW_ACK_SIZE, &size.to_be_bytes()).await
    }

    pub async fn send_set_peer_bandwidth(&mut self, size: u32, limit_type: u8) -> Result<(), ChunkError> {
        let mut body = size.to_be_bytes().to_vec();
        body.push(limit_type);
        self.write_control_message(TYPE_SET_PEER_BANDWIDTH, &body).await
    }

    pub async fn send_set_chunk_size(&mut self, size: u32) -> Result<(), ChunkError> {
        self.local_chunk_size = size;
        self.write_control_message(TYPE_SET_CHUNK_SIZE, &size.to_be_bytes()).await
    }

    pub async fn send_ack(&mut self, sequence_number: u32) -> Result<(), ChunkError> {
        self.write_control_message(TYPE_ACK, &sequence_number.to_be_bytes()).await
    }

    /// Sends a type-4 user control message (`StreamBegin`, `StreamIsRecorded`, ...).
    pub async fn send_user_control(&mut self, event_type: u16, event_data: &[u8]) -> Result<(), ChunkError> {
        let mut body = event_type.to_be_bytes().to_vec();
        body.extend_from_slice(event_data);
        self.write_control_message(TYPE_USER_CONTROL, &body).await
    }

    async fn write_control_message(&mut self, type_id: u8, body: &[u8]) -> Result<(), ChunkError> {
        self.write_message(CONTROL_CSID, type_id, 0, 0, body).await
    }

    /// Writes one complete RTMP message (AMF command, audio/video
    /// payload, ...), splitting it into fmt-0 + fmt-3 chunks of
    /// `local_chunk_size` bytes.
    pub async fn write_message(
        &mut self,
        csid: u32,
        type_id: u8,
        stream_id: u32,
        timestamp: u32,
        data: &[u8],
    ) -> Result<(), ChunkError> {
        write_basic_header(&mut self.stream, 0, csid).await?;
        write_format0_header(&mut self.stream, timestamp, data.len() as u32, type_id, stream_id).await?;

        let needs_extended = timestamp >= 0xff_ffff;
        let mut offset = 0usize;

        while offset < data.len() {
            let chunk_len = (data.len() - offset).min(self.local_chunk_size as usize);
            self.stream.write_all(&data[offset..offset + chunk_len]).await?;
            offset += chunk_len;

            if offset < data.len() {
                write_basic_header(&mut self.stream, 3, csid).await?;
                write_format3_header(&mut self.stream, timestamp, needs_extended).await?;
            }
        }

        self.stream.flush().await?;
        Ok(())
    }

    /// Reads and returns the next application message (audio, video,
    /// command, or aggregate), transparently handling and consuming
    /// protocol control messages (chunk size, window ack size, peer
    /// bandwidth, user control, ack) along the way.
    pub async fn read_message(&mut self) -> Result<Message, ChunkError> {
        loop {
            let (format, csid) = read_basic_header(&mut self.stream).await?;

            let body_read;
            let full;
            let type_id;
            let stream_id;
            let timestamp;
            let mut data = Bytes::new();

            {
                let cs = self
                    .chunk_streams
                    .entry(csid)
                    .or_insert_with(|| ChunkStream::new(csid));

                cs.read_header(&mut self.stream, format).await?;
                body_read = cs.read_body(&mut self.stream, self.remote_chunk_size).await?;
                full = cs.full();
                type_id = cs.type_id;
                stream_id = cs.stream_id;
                timestamp = cs.timestamp;
                if full {
                    data = Bytes::from(std::mem::take(&mut cs.data));
                }
            }

            self.bump_received(body_read as u32).await?;

            if !full {
                continue;
            }

            match type_id {
                TYPE_SET_CHUNK_SIZE if data.len() >= 4 => {
                    self.remote_chunk_size = u32::from_be_bytes(data[0..4].try_into().unwrap());
                }
                TYPE_WINDOW_ACK_SIZE if data.len() >= 4 => {
                    self.remote_window_ack_size = u32::from_be_bytes(data[0..4].try_into().unwrap());
                }
                TYPE_ABORT | TYPE_ACK | TYPE_USER_CONTROL => {}
                _ => {
                    return Ok(Message {
                        type_id,
                        stream_id,
                        timestamp,
                        data,
                    });
                }
            }
        }
    }

    async fn bump_received(&mut self, n: u32) -> Result<(), ChunkError> {
        self.received = self.received.wrapping_add(n);
        if self.received >= RECEIVED_WRAP_AT {
            self.received = 0;
            self.last_ack = 0;
        }

        if self.received.wrapping_sub(self.last_ack) >= self.remote_window_ack_size {
            self.last_ack = self.received;
            self.send_ack(self.received).await?;
        }

        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_reads_back_a_small_message() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = Conn::new(client);

        conn.write_message(AUDIO_CSID, super::super::chunk_stream::TYPE_AUDIO, 1, 42, &[1, 2, 3, 4])
            .await
            .unwrap();

        // Drain what was written directly off the duplex's other half to
        // confirm framing, independent of our own reader.
        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert!(n > 4); // header bytes + payload
    }

    #[tokio::test]
    async fn acknowledges_after_crossing_the_window() {
        let (mut client, server) = tokio::io::duplex(1 << 20);
        let mut conn = Conn::new(server);
        conn.remote_window_ack_size = 16;

        let payload = vec![0xaa; 32];
        let mut wire = Vec::new();
        write_basic_header(&mut wire, 0, AUDIO_CSID).await.unwrap();
        write_format0_header(&mut wire, 0, payload.len() as u32, super::super::chunk_stream::TYPE_AUDIO, 1)
            .await
            .unwrap();
        wire.extend_from_slice(&payload);
        client.write_all(&wire).await.unwrap();

        let msg = conn.read_message().await.unwrap();
        assert_eq!(msg.data.len(), 32);

        // An Ack control message should have been written back to the client.
        let mut ack_buf = vec![0u8; 32];
        let n = tokio::time::timeout(std::time::Duration::from_millis(100), client.read(&mut ack_buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0);
    }
}
