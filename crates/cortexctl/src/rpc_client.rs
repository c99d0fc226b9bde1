//! RPC client for cortexd
//!
//! One request per connection: connect, write the request, half-close,
//! read the response until EOF.

use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cortex_common::paths::{DEFAULT_SOCKET_PATH, SOCKET_ENV};
use cortex_common::protocol::{
    decode_response, encode_request, ErrorCode, Outcome, ParseError, Request, Response,
    MAX_MESSAGE_SIZE,
};
use serde_json::Value;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{hint}")]
    Connect {
        path: PathBuf,
        hint: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error talking to cortexd: {0}")]
    Io(#[from] io::Error),

    #[error("bad response from cortexd: {0}")]
    Protocol(#[from] ParseError),

    #[error("cortexd returned {}: {message}", code.map(ErrorCode::name).unwrap_or("ERROR"))]
    Daemon {
        code: Option<ErrorCode>,
        message: String,
    },
}

impl ClientError {
    /// Protocol error code when the daemon answered with an error
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Daemon { code, .. } => *code,
            _ => None,
        }
    }
}

/// Socket discovery order:
/// 1. explicit path (--socket)
/// 2. $CORTEX_SOCKET
/// 3. system socket, if present
/// 4. per-user socket under the runtime dir, if present
/// 5. system socket path
pub fn discover_socket_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(SOCKET_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    let system = PathBuf::from(DEFAULT_SOCKET_PATH);
    if system.exists() {
        return system;
    }

    if let Some(user) = dirs::runtime_dir().map(|d| d.join("cortex").join("cortex.sock")) {
        if user.exists() {
            return user;
        }
    }

    system
}

/// Connection error with an errno-specific hint
fn connect_error(path: &Path, error: io::Error) -> ClientError {
    let hint = match error.kind() {
        ErrorKind::NotFound => format!(
            "Socket not found at {}. Is cortexd running?\n\
             Try: sudo systemctl status cortexd",
            path.display()
        ),
        ErrorKind::PermissionDenied => {
            let user = std::env::var("USER").unwrap_or_else(|_| "$USER".to_string());
            format!(
                "Permission denied on {}.\n\
                 Add your user to the socket group and log in again:\n\
                 \x20  sudo usermod -aG cortex {}\n\
                 Check with: ls -la {}",
                path.display(),
                user,
                path.display()
            )
        }
        ErrorKind::ConnectionRefused | ErrorKind::TimedOut => format!(
            "cortexd is not accepting connections on {}.\n\
             The socket exists but nothing is listening.\n\
             Try: sudo systemctl restart cortexd",
            path.display()
        ),
        _ => format!("Cannot connect to {}: {}", path.display(), error),
    };

    ClientError::Connect {
        path: path.to_path_buf(),
        hint,
        source: error,
    }
}

pub struct RpcClient {
    path: PathBuf,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(socket: Option<&str>) -> Self {
        Self {
            path: discover_socket_path(socket),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Send one request and return the daemon's full response
    pub fn send(&self, request: &Request) -> Result<Response, ClientError> {
        let mut stream =
            UnixStream::connect(&self.path).map_err(|e| connect_error(&self.path, e))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        stream.write_all(&encode_request(request))?;
        stream.flush()?;
        stream.shutdown(std::net::Shutdown::Write)?;

        let mut buf = Vec::with_capacity(4096);
        stream
            .take(MAX_MESSAGE_SIZE as u64 * 16)
            .read_to_end(&mut buf)?;

        Ok(decode_response(&buf)?)
    }

    /// Call `method`, turning a daemon error into `ClientError::Daemon`
    pub fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let response = self.send(&Request::new(method).with_params(params))?;
        match response.outcome {
            Outcome::Ok(result) => Ok(result),
            Outcome::Err(e) => Err(ClientError::Daemon {
                code: e.error_code(),
                message: e.message,
            }),
        }
    }
}
