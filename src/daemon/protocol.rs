//! Daemon protocol: request/response types and their wire framing.
//!
//! Every message is a 4-byte big-endian payload length followed by a JSON
//! payload. A frame is written with a single `write_all`, and each
//! connection has exactly one writer, so frames never interleave.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::analysis::{Diagnostic, TypeInfo};
use crate::error::{CheckdError, Result};

/// Frames larger than this are refused and the connection is dropped.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Request from a client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    /// Current diagnostics for the whole project
    FlushDiagnostics,

    /// Type of a qualified name
    TypeQuery { expression: String },

    /// Files changed on disk; answered once the recheck is committed
    FileChanged { paths: Vec<PathBuf> },

    /// Shut the daemon down
    Stop,

    /// Keep this connection open for diagnostic pushes
    Subscribe,

    /// Mark this connection as a long-lived source of `FileChanged`
    RegisterFileNotifier,

    /// Check if the daemon is alive
    Ping,

    Status,

    /// Write a snapshot of the current state to `path`
    SaveState { path: PathBuf },
}

/// Response from the daemon. Subscribers also receive unsolicited
/// `Diagnostics` after every recheck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    Diagnostics { diagnostics: Vec<Diagnostic> },

    QueryResult { info: TypeInfo },

    Error { message: String },

    Ack,

    Pong,

    Status { status: ServerStatus },

    Subscribed { client_id: Uuid },
}

impl Response {
    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error {
            message: msg.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub pid: u32,
    /// Socket the server is listening on.
    pub socket: Option<PathBuf>,
    pub project_root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub files: usize,
    pub diagnostics: usize,
    pub persistent_clients: usize,
    pub file_notifiers: usize,
    pub watcher_pid: Option<u32>,
    /// Digest of the configuration fingerprint.
    pub fingerprint: String,
}

/// Write one framed message.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(CheckdError::ProtocolError(format!(
            "message too large: {} bytes",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame's payload. `None` means the peer closed the connection
/// cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(CheckdError::ProtocolError(format!(
            "message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Decode a payload, reporting malformed input as a protocol error.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| CheckdError::ProtocolError(format!("malformed message: {e}")))
}

/// Read and decode one message.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(payload) => decode(&payload).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::DiagnosticCode;

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&Request::TypeQuery {
            expression: "a.x".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"command":"type_query","expression":"a.x"}"#);

        let parsed: Request = serde_json::from_str(r#"{"command":"flush_diagnostics"}"#).unwrap();
        assert_eq!(parsed, Request::FlushDiagnostics);
        assert!(serde_json::from_str::<Request>(r#"{"command":"explode"}"#).is_err());
    }

    #[test]
    fn test_response_wire_format() {
        let status = ServerStatus {
            pid: 42,
            socket: Some(PathBuf::from("/run/checkd.sock")),
            project_root: PathBuf::from("/p"),
            started_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            uptime_secs: 3,
            files: 2,
            diagnostics: 1,
            persistent_clients: 0,
            file_notifiers: 0,
            watcher_pid: None,
            fingerprint: "abc".into(),
        };
        let value = serde_json::to_value(&Response::Status {
            status: status.clone(),
        })
        .unwrap();
        assert_eq!(value["response"], "status");
        assert_eq!(value["status"]["pid"], 42);
        assert_eq!(value["status"]["fingerprint"], "abc");
        let parsed: Response = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, Response::Status { status });

        let json = serde_json::to_string(&Response::Diagnostics {
            diagnostics: vec![],
        })
        .unwrap();
        assert_eq!(json, r#"{"response":"diagnostics","diagnostics":[]}"#);

        let parsed: Response = serde_json::from_str(r#"{"response":"ack"}"#).unwrap();
        assert_eq!(parsed, Response::Ack);
        let parsed: Response =
            serde_json::from_str(r#"{"response":"error","message":"nope"}"#).unwrap();
        assert_eq!(parsed, Response::error("nope"));
    }

    #[tokio::test]
    async fn test_frames_keep_boundaries() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_message(&mut client, &Request::Ping).await.unwrap();
            write_message(
                &mut client,
                &Request::FileChanged {
                    paths: vec![PathBuf::from("/p/a.py")],
                },
            )
            .await
            .unwrap();
        });

        let first: Option<Request> = read_message(&mut server).await.unwrap();
        let second: Option<Request> = read_message(&mut server).await.unwrap();
        writer.await.unwrap();
        let third: Option<Request> = read_message(&mut server).await.unwrap();

        assert_eq!(first, Some(Request::Ping));
        assert!(matches!(second, Some(Request::FileChanged { paths }) if paths.len() == 1));
        assert_eq!(third, None);
    }

    #[tokio::test]
    async fn test_response_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let response = Response::Diagnostics {
            diagnostics: vec![Diagnostic {
                path: PathBuf::from("/p/a.py"),
                line: 8,
                column: 5,
                code: DiagnosticCode::IncompatibleReturnType,
                message: "bad".into(),
            }],
        };
        write_message(&mut server, &response).await.unwrap();
        let read: Response = read_message(&mut client).await.unwrap().unwrap();
        assert_eq!(read, response);
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, CheckdError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let payload = b"{not json";
        client
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(payload).await.unwrap();

        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert!(matches!(
            decode::<Request>(&frame),
            Err(CheckdError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(CheckdError::Io(_))
        ));
    }
}
