//! Client side of the daemon protocol.
//!
//! [`connect`] retries while no server is listening yet (the socket file is
//! missing or nobody accepts on it), which covers the window between
//! starting a server and it binding its socket.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use super::protocol::{read_message, write_message, Request, Response, ServerStatus};
use crate::analysis::{Diagnostic, TypeInfo};
use crate::error::{CheckdError, Result};

/// Attempts made by [`DaemonClient::connect`].
pub const DEFAULT_RETRIES: usize = 20;

/// Pause between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Open a stream to the server at `socket`, trying `retries` times in all
/// (at least once) with `delay` in between.
///
/// Only "nobody is listening" failures are retried; anything else is
/// returned immediately. Running out of attempts is
/// [`CheckdError::ConnectionFailure`].
pub async fn connect(socket: &Path, retries: usize, delay: Duration) -> Result<UnixStream> {
    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        match UnixStream::connect(socket).await {
            Ok(stream) => {
                debug!(socket = %socket.display(), attempt, "connected");
                return Ok(stream);
            }
            Err(e) if is_not_listening(&e) => {
                debug!(socket = %socket.display(), attempt, error = %e, "server not listening");
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(CheckdError::ConnectionFailure {
        socket: socket.to_path_buf(),
        attempts,
    })
}

fn is_not_listening(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused)
}

/// A connection to a running server.
#[derive(Debug)]
pub struct DaemonClient {
    socket: PathBuf,
    stream: UnixStream,
    timeout: Option<Duration>,
}

impl DaemonClient {
    /// Connect with the default retry policy.
    pub async fn connect(socket: &Path) -> Result<Self> {
        Self::connect_with(socket, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY).await
    }

    pub async fn connect_with(socket: &Path, retries: usize, delay: Duration) -> Result<Self> {
        let stream = connect(socket, retries, delay).await?;
        Ok(Self {
            socket: socket.to_path_buf(),
            stream,
            timeout: None,
        })
    }

    /// Give up on a request that takes longer than `limit`.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Send `request` and wait for its response.
    ///
    /// A subscribed connection also carries pushes, so once subscribed use
    /// [`DaemonClient::next_push`] rather than issuing further requests.
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        debug!(?request, "sending request");
        write_message(&mut self.stream, request).await?;
        self.read_response().await
    }

    async fn read_response(&mut self) -> Result<Response> {
        let read = read_message::<_, Response>(&mut self.stream);
        let response = match self.timeout {
            Some(limit) => timeout(limit, read).await.map_err(|_| {
                CheckdError::Io(std::io::Error::new(
                    ErrorKind::TimedOut,
                    format!("no response within {}ms", limit.as_millis()),
                ))
            })??,
            None => read.await?,
        };
        response.ok_or_else(|| {
            CheckdError::ProtocolError("server closed the connection".to_string())
        })
    }

    pub async fn flush_diagnostics(&mut self) -> Result<Vec<Diagnostic>> {
        match self.request(&Request::FlushDiagnostics).await? {
            Response::Diagnostics { diagnostics } => Ok(diagnostics),
            other => Err(unexpected(other)),
        }
    }

    pub async fn type_query(&mut self, expression: &str) -> Result<TypeInfo> {
        let request = Request::TypeQuery {
            expression: expression.to_string(),
        };
        match self.request(&request).await? {
            Response::QueryResult { info } => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    /// Report changed files. Returns once the server has committed the
    /// recheck.
    pub async fn file_changed(&mut self, paths: Vec<PathBuf>) -> Result<()> {
        self.expect_ack(&Request::FileChanged { paths }).await
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.expect_ack(&Request::Stop).await
    }

    /// Register for diagnostic pushes.
    pub async fn subscribe(&mut self) -> Result<Uuid> {
        match self.request(&Request::Subscribe).await? {
            Response::Subscribed { client_id } => Ok(client_id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn register_file_notifier(&mut self) -> Result<()> {
        self.expect_ack(&Request::RegisterFileNotifier).await
    }

    /// Next unsolicited diagnostic set. `None` once the server hangs up.
    pub async fn next_push(&mut self) -> Result<Option<Vec<Diagnostic>>> {
        match read_message::<_, Response>(&mut self.stream).await? {
            Some(Response::Diagnostics { diagnostics }) => Ok(Some(diagnostics)),
            Some(other) => Err(unexpected(other)),
            None => Ok(None),
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        match self.request(&Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&mut self) -> Result<ServerStatus> {
        match self.request(&Request::Status).await? {
            Response::Status { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn save_state(&mut self, path: &Path) -> Result<()> {
        self.expect_ack(&Request::SaveState {
            path: path.to_path_buf(),
        })
        .await
    }

    async fn expect_ack(&mut self, request: &Request) -> Result<()> {
        match self.request(request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> CheckdError {
    match response {
        Response::Error { message } => CheckdError::Server(message),
        other => CheckdError::ProtocolError(format!("unexpected response: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_gives_up_after_exactly_n_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nobody.sock");
        let start = Instant::now();
        let err = connect(&socket, 3, Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            CheckdError::ConnectionFailure { socket: s, attempts } => {
                assert_eq!(s, socket);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected ConnectionFailure, got {other:?}"),
        }
        // Two pauses between three attempts.
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());

        let err = connect(&socket, 2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckdError::ConnectionFailure { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_succeeds_once_listener_appears() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("late.sock");
        let bind_at = socket.clone();
        let listener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = UnixListener::bind(&bind_at).unwrap();
            let _ = listener.accept().await.unwrap();
        });

        connect(&socket, 50, Duration::from_millis(20)).await.unwrap();
        listener.await.unwrap();
    }

    #[test]
    fn test_error_response_becomes_server_error() {
        assert!(matches!(
            unexpected(Response::error("boom")),
            CheckdError::Server(m) if m == "boom"
        ));
        assert!(matches!(
            unexpected(Response::Pong),
            CheckdError::ProtocolError(_)
        ));
    }
}
