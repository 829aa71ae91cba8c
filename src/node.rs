//! Line-delimited JSON access to a [`DhtNetwork`] over TCP.
//!
//! Each request is one line `{"id": n, "request": {"op": ..., ...}}` and gets
//! exactly one response line `{"id": n, "ok": ...}` or
//! `{"id": n, "err": {"kind": ..., "message": ...}}`. Every connection is its
//! own client: records it leaves open are closed when it disconnects.
//!
//! The node takes a writer's public key at face value when a record is
//! opened. It is a local stand-in for a real DHT, not a trust boundary.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dht::{
    base64_bytes, DhtClient, DhtNetwork, DhtRecordDescriptor, DhtSchema, InMemoryDht, RecordKey,
    ValueData, ValueSubkey,
};
use crate::keys::{encode_public_key, parse_public_key, KeyPair};
use crate::types::{ChatError, Result};

/// Default node port.
pub const DEFAULT_PORT: u16 = 5959;

// ============================================================================
// Wire format
// ============================================================================

/// One DHT operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateRecord {
        schema: DhtSchema,
    },
    OpenRecord {
        key: RecordKey,
        /// Writer public key, hex.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        writer: Option<String>,
    },
    CloseRecord {
        key: RecordKey,
    },
    DeleteRecord {
        key: RecordKey,
    },
    SetValue {
        key: RecordKey,
        subkey: ValueSubkey,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    GetValue {
        key: RecordKey,
        subkey: ValueSubkey,
        force_refresh: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestFrame {
    id: u64,
    request: Request,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponseFrame {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ok: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    err: Option<WireError>,
}

/// Error classes that survive the trip over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    NotOpen,
    Unauthorized,
    InvalidSubkey,
    ValueTooLarge,
    SequenceExhausted,
    InvalidSchema,
    InvalidRequest,
    Internal,
}

/// Error body of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    /// Subkey or size the error refers to, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<u64>,
}

impl From<&ChatError> for WireError {
    fn from(e: &ChatError) -> Self {
        let (kind, arg) = match e {
            ChatError::RecordNotFound(_) => (ErrorKind::NotFound, None),
            ChatError::RecordNotOpen(_) => (ErrorKind::NotOpen, None),
            ChatError::Unauthorized(subkey) => (ErrorKind::Unauthorized, Some(*subkey as u64)),
            ChatError::InvalidSubkey(subkey) => (ErrorKind::InvalidSubkey, Some(*subkey as u64)),
            ChatError::ValueTooLarge(len) => (ErrorKind::ValueTooLarge, Some(*len as u64)),
            ChatError::SequenceExhausted(subkey) => {
                (ErrorKind::SequenceExhausted, Some(*subkey as u64))
            }
            ChatError::InvalidSchema(_) => (ErrorKind::InvalidSchema, None),
            ChatError::InvalidPublicKey(_)
            | ChatError::InvalidRecordKey(_)
            | ChatError::Serialization(_) => (ErrorKind::InvalidRequest, None),
            _ => (ErrorKind::Internal, None),
        };
        Self {
            kind,
            message: e.to_string(),
            arg,
        }
    }
}

impl From<WireError> for ChatError {
    fn from(e: WireError) -> Self {
        let arg = e.arg.unwrap_or_default();
        match e.kind {
            ErrorKind::NotFound => ChatError::RecordNotFound(e.message),
            ErrorKind::NotOpen => ChatError::RecordNotOpen(e.message),
            ErrorKind::Unauthorized => ChatError::Unauthorized(arg as u32),
            ErrorKind::InvalidSubkey => ChatError::InvalidSubkey(arg as u32),
            ErrorKind::ValueTooLarge => ChatError::ValueTooLarge(arg as usize),
            ErrorKind::SequenceExhausted => ChatError::SequenceExhausted(arg as u32),
            ErrorKind::InvalidSchema => ChatError::InvalidSchema(e.message),
            ErrorKind::InvalidRequest | ErrorKind::Internal => ChatError::Protocol(e.message),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// TCP front end for a [`DhtNetwork`].
pub struct NodeServer {
    listener: TcpListener,
    network: DhtNetwork,
}

impl NodeServer {
    /// Bind to `addr`, serving `network`.
    pub async fn bind<A: ToSocketAddrs>(addr: A, network: DhtNetwork) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ChatError::Transport(format!("Failed to bind: {}", e)))?;
        Ok(Self { listener, network })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "node listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "client connected");
            let network = self.network.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, network).await {
                    warn!(%peer, error = %e, "connection ended with error");
                }
                debug!(%peer, "client disconnected");
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, network: DhtNetwork) -> Result<()> {
    let dht = network.client();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let result = async {
        while let Some(line) = lines.next_line().await? {
            let response = match serde_json::from_str::<RequestFrame>(&line) {
                Ok(frame) => match dispatch(&dht, frame.request).await {
                    Ok(value) => ResponseFrame {
                        id: frame.id,
                        ok: Some(value),
                        err: None,
                    },
                    Err(e) => ResponseFrame {
                        id: frame.id,
                        ok: None,
                        err: Some(WireError::from(&e)),
                    },
                },
                Err(e) => ResponseFrame {
                    id: 0,
                    ok: None,
                    err: Some(WireError {
                        kind: ErrorKind::InvalidRequest,
                        message: e.to_string(),
                        arg: None,
                    }),
                },
            };

            let mut out = serde_json::to_vec(&response)?;
            out.push(b'\n');
            write_half.write_all(&out).await?;
        }
        Ok::<(), ChatError>(())
    }
    .await;

    dht.close_all().await;
    result
}

async fn dispatch(dht: &InMemoryDht, request: Request) -> Result<serde_json::Value> {
    let value = match request {
        Request::CreateRecord { schema } => serde_json::to_value(dht.create_record(schema).await?)?,
        Request::OpenRecord { key, writer } => {
            let writer = writer
                .map(|w| parse_public_key(&w).map(|k| *k.as_bytes()))
                .transpose()?;
            serde_json::to_value(dht.open_record_as(&key, writer).await?)?
        }
        Request::CloseRecord { key } => {
            dht.close_record(&key).await?;
            serde_json::Value::Null
        }
        Request::DeleteRecord { key } => {
            dht.delete_record(&key).await?;
            serde_json::Value::Null
        }
        Request::SetValue { key, subkey, data } => {
            dht.set_value(&key, subkey, data).await?;
            serde_json::Value::Null
        }
        Request::GetValue {
            key,
            subkey,
            force_refresh,
        } => serde_json::to_value(dht.get_value(&key, subkey, force_refresh).await?)?,
    };
    Ok(value)
}

// ============================================================================
// Client
// ============================================================================

type Pending = (RequestFrame, oneshot::Sender<Result<ResponseFrame>>);

/// [`DhtClient`] that talks to a [`NodeServer`].
///
/// A background task owns the socket, so a caller that gives up on a request
/// (for instance a cancelled poll) never leaves half a request or an unread
/// response on the stream.
pub struct RemoteDht {
    requests: mpsc::Sender<Pending>,
    next_id: AtomicU64,
    task: JoinHandle<()>,
}

impl RemoteDht {
    /// Connect to the node at `host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        debug!(host, port, "connecting to node");
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ChatError::Transport(format!("Failed to connect to {}:{}: {}", host, port, e)))?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(connection_task(BufReader::new(read_half).lines(), write_half, rx));
        Self {
            requests: tx,
            next_id: AtomicU64::new(1),
            task,
        }
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.requests
            .send((RequestFrame { id, request }, reply_tx))
            .await
            .map_err(|_| ChatError::Transport("connection to node is closed".to_string()))?;
        let frame = reply_rx
            .await
            .map_err(|_| ChatError::Transport("connection to node is closed".to_string()))??;

        if let Some(err) = frame.err {
            return Err(err.into());
        }
        let value = frame.ok.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value)
            .map_err(|e| ChatError::Protocol(format!("unexpected response: {}", e)))
    }
}

impl Drop for RemoteDht {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn connection_task(
    mut reader: Lines<BufReader<OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    mut requests: mpsc::Receiver<Pending>,
) {
    while let Some((frame, reply)) = requests.recv().await {
        let id = frame.id;
        let result = exchange(&mut reader, &mut writer, frame).await;
        let failed = result.is_err();
        if reply.send(result).is_err() {
            debug!(id, "caller gave up on request");
        }
        if failed {
            break;
        }
    }
}

async fn exchange(
    reader: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
    frame: RequestFrame,
) -> Result<ResponseFrame> {
    let mut out = serde_json::to_vec(&frame)?;
    out.push(b'\n');
    writer
        .write_all(&out)
        .await
        .map_err(|e| ChatError::Transport(format!("write to node failed: {}", e)))?;

    let line = reader
        .next_line()
        .await
        .map_err(|e| ChatError::Transport(format!("read from node failed: {}", e)))?
        .ok_or_else(|| ChatError::Transport("node closed the connection".to_string()))?;

    let response: ResponseFrame = serde_json::from_str(&line)
        .map_err(|e| ChatError::Protocol(format!("malformed response: {}", e)))?;
    if response.id != frame.id {
        return Err(ChatError::Protocol(format!(
            "response id {} does not match request id {}",
            response.id, frame.id
        )));
    }
    Ok(response)
}

#[async_trait::async_trait]
impl DhtClient for RemoteDht {
    async fn create_record(&self, schema: DhtSchema) -> Result<DhtRecordDescriptor> {
        self.call(Request::CreateRecord { schema }).await
    }

    async fn open_record(
        &self,
        key: &RecordKey,
        writer: Option<&KeyPair>,
    ) -> Result<DhtRecordDescriptor> {
        self.call(Request::OpenRecord {
            key: *key,
            writer: writer.map(|w| encode_public_key(w.public())),
        })
        .await
    }

    async fn close_record(&self, key: &RecordKey) -> Result<()> {
        self.call(Request::CloseRecord { key: *key }).await
    }

    async fn delete_record(&self, key: &RecordKey) -> Result<()> {
        self.call(Request::DeleteRecord { key: *key }).await
    }

    async fn set_value(&self, key: &RecordKey, subkey: ValueSubkey, data: Vec<u8>) -> Result<()> {
        self.call(Request::SetValue {
            key: *key,
            subkey,
            data,
        })
        .await
    }

    async fn get_value(
        &self,
        key: &RecordKey,
        subkey: ValueSubkey,
        force_refresh: bool,
    ) -> Result<Option<ValueData>> {
        self.call(Request::GetValue {
            key: *key,
            subkey,
            force_refresh,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let key = RecordKey::random();
        let frame = RequestFrame {
            id: 7,
            request: Request::GetValue {
                key,
                subkey: 1,
                force_refresh: true,
            },
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["request"]["op"], "get_value");
        assert_eq!(json["request"]["key"], key.to_string());
        assert_eq!(json["request"]["force_refresh"], true);
    }

    #[test]
    fn test_set_value_data_is_base64() {
        let request = Request::SetValue {
            key: RecordKey::random(),
            subkey: 0,
            data: vec![0xff, 0x00, 0x10],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["data"], "_wAQ");
        let back: Request = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_error_kinds_survive_the_wire() {
        let cases = vec![
            ChatError::RecordNotFound("k".into()),
            ChatError::RecordNotOpen("k".into()),
            ChatError::Unauthorized(1),
            ChatError::InvalidSubkey(9),
            ChatError::ValueTooLarge(40000),
            ChatError::SequenceExhausted(0),
        ];
        for sent in cases {
            let wire = WireError::from(&sent);
            let json = serde_json::to_string(&wire).unwrap();
            let back: ChatError = serde_json::from_str::<WireError>(&json).unwrap().into();
            assert_eq!(back.is_not_found(), sent.is_not_found());
            assert_eq!(
                std::mem::discriminant(&back),
                std::mem::discriminant(&sent)
            );
        }

        let back: ChatError = WireError::from(&ChatError::Unauthorized(1)).into();
        assert!(matches!(back, ChatError::Unauthorized(1)));
    }

    #[test]
    fn test_unit_response_parses() {
        let frame: ResponseFrame = serde_json::from_str(r#"{"id":3,"ok":null}"#).unwrap();
        assert_eq!(frame.id, 3);
        assert!(frame.err.is_none());
        serde_json::from_value::<()>(frame.ok.unwrap_or(serde_json::Value::Null)).unwrap();
    }
}
