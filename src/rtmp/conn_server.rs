//! The AMF0 command state machine layered on top of the chunk transport:
//! `connect` → `createStream` → `publish`/`play` negotiation.

use std::io;

use ripplecast_protocol::{decode_batch, encode_command, Object, Value};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::RtmpError;

use super::chunk_stream::{TYPE_COMMAND_AMF0, TYPE_COMMAND_AMF3};
use super::conn::{Conn, COMMAND_CSID};

const FMS_VERSION: &str = "FMS/3,0,1,123";
const CAPABILITIES: f64 = 31.0;

const EVENT_STREAM_BEGIN: u16 = 0;
const EVENT_STREAM_IS_RECORDED: u16 = 4;

/// What the publisher/player asked for, once `publish` or `play` arrives.
#[derive(Debug, Clone)]
pub enum Intent {
    Publish { name: String, publish_type: String },
    Play { name: String },
}

/// Negotiated connection metadata captured from the `connect` command.
#[derive(Debug, Clone, Default)]
pub struct ConnectInfo {
    pub app: String,
    pub flash_ver: String,
    pub tc_url: String,
    pub object_encoding: f64,
}

pub struct ConnServer<S> {
    conn: Conn<S>,
    pub connect_info: ConnectInfo,
}

impl<S> ConnServer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(conn: Conn<S>) -> Self {
        ConnServer {
            conn,
            connect_info: ConnectInfo::default(),
        }
    }

    /// Drives the command state machine until `publish` or `play` is
    /// seen, returning the caller's intent. Any other command
    /// (`FCPublish`, `releaseStream`, ...) is acknowledged as a no-op and
    /// the loop continues; unrecognised commands are handed to
    /// `on_other` for the embedder to observe.
    pub async fn handshake_commands<F>(&mut self, mut on_other: F) -> Result<Intent, RtmpError>
    where
        F: FnMut(&[Value]),
    {
        loop {
            let msg = self.conn.read_message().await.map_err(RtmpError::Chunk)?;

            if msg.type_id != TYPE_COMMAND_AMF0 && msg.type_id != TYPE_COMMAND_AMF3 {
                continue;
            }

            let body: &[u8] = if msg.type_id == TYPE_COMMAND_AMF3 {
                // AMF3 command messages carry a leading marker byte before
                // the (AMF0-shaped) command payload; this library does not
                // decode AMF3 values natively.
                &msg.data[1.min(msg.data.len())..]
            } else {
                &msg.data[..]
            };

            let mut cursor = io::Cursor::new(body);
            let values = decode_batch(&mut cursor)?;

            let Some(Value::String(name)) = values.first() else {
                continue;
            };

            match name.as_str() {
                "connect" => self.handle_connect(&values).await?,
                "createStream" => self.handle_create_stream(&values).await?,
                "publish" => return self.handle_publish(&values).await,
                "play" => return self.handle_play(&values).await,
                "FCPublish" | "releaseStream" | "FCUnpublish" | "deleteStream" => {
                    self.handle_noop_ack(&values).await?;
                }
                _ => on_other(&values),
            }
        }
    }

    async fn handle_connect(&mut self, values: &[Value]) -> Result<(), RtmpError> {
        let txn_id = values.get(1).and_then(Value::as_f64).unwrap_or(0.0);
        if txn_id != 1.0 {
            return Err(RtmpError::BadConnectTxnId(txn_id));
        }

        if let Some(obj) = values.get(2).and_then(Value::as_object) {
            if let Some(app) = Value::object_get(obj, "app").and_then(Value::as_str) {
                self.connect_info.app = app.to_owned();
            }
            if let Some(v) = Value::object_get(obj, "flashVer").and_then(Value::as_str) {
                self.connect_info.flash_ver = v.to_owned();
            }
            if let Some(v) = Value::object_get(obj, "tcUrl").and_then(Value::as_str) {
                self.connect_info.tc_url = v.to_owned();
            }
            if let Some(v) = Value::object_get(obj, "objectEncoding").and_then(Value::as_f64) {
                self.connect_info.object_encoding = v;
            }
        }

        self.conn.send_connect_preamble().await.map_err(RtmpError::Chunk)?;

        let status: Object = vec![
            ("level".to_owned(), Value::from("status")),
            ("code".to_owned(), Value::from("NetConnection.Connect.Success")),
            ("description".to_owned(), Value::from("Connection succeeded.")),
            ("objectEncoding".to_owned(), Value::from(self.connect_info.object_encoding)),
        ];

        let reply = encode_command(&[
            Value::from("_result"),
            Value::from(1.0),
            Value::Object(vec![
                ("fmsVer".to_owned(), Value::from(FMS_VERSION)),
                ("capabilities".to_owned(), Value::from(CAPABILITIES)),
            ]),
            Value::Object(status),
        ])?;

        self.send_command(&reply).await
    }

    async fn handle_create_stream(&mut self, values: &[Value]) -> Result<(), RtmpError> {
        let txn_id = values.get(1).and_then(Value::as_f64).unwrap_or(0.0);
        let reply = encode_command(&[Value::from("_result"), Value::from(txn_id), Value::Null, Value::from(1.0)])?;
        self.send_command(&reply).await
    }

    async fn handle_noop_ack(&mut self, values: &[Value]) -> Result<(), RtmpError> {
        let txn_id = values.get(1).and_then(Value::as_f64).unwrap_or(0.0);
        let reply = encode_command(&[Value::from("_result"), Value::from(txn_id), Value::Null, Value::Null])?;
        self.send_command(&reply).await
    }

    async fn handle_publish(&mut self, values: &[Value]) -> Result<Intent, RtmpError> {
        let name = values
            .get(3)
            .and_then(Value::as_str)
            .ok_or(RtmpError::MissingField("publish.name"))?
            .to_owned();
        let publish_type = values
            .get(4)
            .and_then(Value::as_str)
            .unwrap_or("live")
            .to_owned();

        Ok(Intent::Publish { name, publish_type })
    }

    async fn handle_play(&mut self, values: &[Value]) -> Result<Intent, RtmpError> {
        let name = values
            .get(3)
            .and_then(Value::as_str)
            .ok_or(RtmpError::MissingField("play.name"))?
            .to_owned();

        Ok(Intent::Play { name })
    }

    /// Sends the `onStatus` acknowledgement for a successful `publish`.
    pub async fn accept_publish(&mut self) -> Result<(), RtmpError> {
        let status: Object = vec![
            ("level".to_owned(), Value::from("status")),
            ("code".to_owned(), Value::from("NetStream.Publish.Start")),
            ("description".to_owned(), Value::from("Start publishing.")),
        ];
        let reply = encode_command(&[Value::from("onStatus"), Value::from(0.0), Value::Null, Value::Object(status)])?;
        self.send_command(&reply).await
    }

    /// Sends the user-control preamble and `onStatus` sequence for a
    /// successful `play`: `StreamIsRecorded`, `StreamBegin`, then
    /// `Play.Reset`, `Play.Start`, `Data.Start`, `Play.PublishNotify`.
    pub async fn accept_play(&mut self) -> Result<(), RtmpError> {
        self.conn
            .send_user_control(EVENT_STREAM_IS_RECORDED, &1u32.to_be_bytes())
            .await
            .map_err(RtmpError::Chunk)?;
        self.conn
            .send_user_control(EVENT_STREAM_BEGIN, &1u32.to_be_bytes())
            .await
            .map_err(RtmpError::Chunk)?;

        for (code, description) in [
            ("NetStream.Play.Reset", "Playing and resetting."),
            ("NetStream.Play.Start", "Started playing."),
            ("NetStream.Data.Start", "Started data."),
            ("NetStream.Play.PublishNotify", "Now publishing."),
        ] {
            let status: Object = vec![
                ("level".to_owned(), Value::from("status")),
                ("code".to_owned(), Value::from(code)),
                ("description".to_owned(), Value::from(description)),
            ];
            let reply =
                encode_command(&[Value::from("onStatus"), Value::from(0.0), Value::Null, Value::Object(status)])?;
            self.send_command(&reply).await?;
        }

        Ok(())
    }

    async fn send_command(&mut self, bytes: &[u8]) -> Result<(), RtmpError> {
        self.conn
            .write_message(COMMAND_CSID, TYPE_COMMAND_AMF0, 0, 0, bytes)
            .await
            .map_err(RtmpError::Chunk)
    }

    pub fn conn_mut(&mut self) -> &mut Conn<S> {
        &mut self.conn
    }

    pub fn into_conn(self) -> Conn<S> {
        self.conn
    }
}
