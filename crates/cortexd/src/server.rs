//! IPC Server - Unix domain socket, one JSON request per connection
//!
//! Protocol:
//!   client connects, writes one JSON request, reads one JSON response,
//!   connection closes. Requests larger than 64 KiB are rejected.
//!
//! Connections are served one at a time on the accept thread. The rate
//! limiter is consulted before a request is decoded.

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cortex_common::protocol::{
    encode_response, parse_request, ErrorCode, ParseError, Request, Response, MAX_MESSAGE_SIZE,
};
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::handlers::HandlerTable;
use crate::rate_limiter::RateLimiter;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("socket setup failed: {0}")]
    Sys(#[from] nix::Error),
    #[error("unknown socket group '{0}'")]
    UnknownGroup(String),
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub socket_path: PathBuf,
    pub backlog: i32,
    pub request_timeout: Duration,
    pub socket_group: Option<String>,
}

impl From<&ServerConfig> for ServerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            socket_path: PathBuf::from(&config.socket_path),
            backlog: config.socket_backlog,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            socket_group: config.socket_group.clone(),
        }
    }
}

/// Shared by the accept thread and the owning handle
struct Shared {
    listener: UnixListener,
    handlers: HandlerTable,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
    running: AtomicBool,
    served: AtomicU64,
}

pub struct IpcServer {
    path: PathBuf,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IpcServer {
    /// Create the socket file, bind and listen. Nothing is accepted until `spawn`.
    pub fn bind(
        options: &ServerOptions,
        handlers: HandlerTable,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, ServerError> {
        let path = options.socket_path.clone();

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        // Remove stale socket if exists, dangling symlinks included
        if std::fs::symlink_metadata(&path).is_ok() {
            std::fs::remove_file(&path)?;
        }

        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new(&path)?;
        socket::bind(fd.as_raw_fd(), &addr)?;
        socket::listen(&fd, Backlog::new(options.backlog.max(1))?)?;
        let listener = UnixListener::from(fd);

        if let Err(e) = set_access(&path, options.socket_group.as_deref()) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        info!(
            "[IPC] Listening on {} (backlog {}, {} methods)",
            path.display(),
            options.backlog,
            handlers.len()
        );

        Ok(Self {
            path,
            shared: Arc::new(Shared {
                listener,
                handlers,
                limiter,
                timeout: options.request_timeout,
                running: AtomicBool::new(false),
                served: AtomicU64::new(0),
            }),
            thread: Mutex::new(None),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Requests answered so far
    pub fn served(&self) -> u64 {
        self.shared.served.load(Ordering::Relaxed)
    }

    /// Start the accept thread
    pub fn spawn(&self) -> io::Result<()> {
        let mut slot = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("cortexd-ipc".to_string())
            .spawn(move || accept_loop(&shared))?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stop accepting and join the accept thread. Safe to call twice.
    pub fn stop(&self) {
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            return;
        };

        self.shared.running.store(false, Ordering::SeqCst);
        // Wake the blocking accept
        let _ = UnixStream::connect(&self.path);

        if handle.join().is_err() {
            error!("[IPC] Accept thread panicked");
        }
        info!("[IPC] Stopped after {} requests", self.served());
    }

    /// Remove the socket file
    pub fn cleanup(&self) {
        if std::fs::symlink_metadata(&self.path).is_ok() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("[IPC] Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.stop();
        self.cleanup();
    }
}

/// 0o660 + group ownership when a group is configured, else 0o666
fn set_access(path: &Path, group: Option<&str>) -> Result<(), ServerError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = match group {
        Some(name) => {
            let group = nix::unistd::Group::from_name(name)?
                .ok_or_else(|| ServerError::UnknownGroup(name.to_string()))?;
            nix::unistd::chown(path, None, Some(group.gid))?;
            0o660
        }
        None => 0o666,
    };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

fn accept_loop(shared: &Shared) {
    for stream in shared.listener.incoming() {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                if let Err(e) = serve_connection(shared, stream) {
                    debug!("[IPC] Connection error: {}", e);
                }
            }
            Err(e) => warn!("[IPC] Accept failed: {}", e),
        }
    }
    debug!("[IPC] Accept loop exited");
}

enum Incoming {
    /// Client closed without sending anything
    Empty,
    TooLarge,
    /// Read ended before a complete JSON value arrived
    Truncated,
    Complete(Result<Request, ParseError>),
}

/// Read until one complete JSON value, EOF, timeout, or the size cap
fn read_request(stream: &mut UnixStream) -> io::Result<Incoming> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = match stream.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(if buf.is_empty() {
                    Incoming::Empty
                } else {
                    Incoming::Truncated
                });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        if n == 0 {
            if buf.is_empty() {
                return Ok(Incoming::Empty);
            }
            return Ok(match parse_request(&buf) {
                Err(ParseError::Incomplete) => Incoming::Truncated,
                other => Incoming::Complete(other),
            });
        }

        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_MESSAGE_SIZE {
            return Ok(Incoming::TooLarge);
        }

        match parse_request(&buf) {
            Err(ParseError::Incomplete) => continue,
            other => return Ok(Incoming::Complete(other)),
        }
    }
}

fn serve_connection(shared: &Shared, mut stream: UnixStream) -> io::Result<()> {
    stream.set_read_timeout(Some(shared.timeout))?;
    stream.set_write_timeout(Some(shared.timeout))?;

    let incoming = read_request(&mut stream)?;
    if matches!(incoming, Incoming::Empty) {
        return Ok(());
    }

    let response = if !shared.limiter.try_acquire() {
        debug!("[IPC] Rate limit exceeded");
        Response::error(ErrorCode::RateLimited, "Rate limit exceeded")
    } else {
        match incoming {
            Incoming::Empty => return Ok(()),
            Incoming::TooLarge => {
                warn!("[IPC] Rejected request over {} bytes", MAX_MESSAGE_SIZE);
                Response::error(ErrorCode::InvalidRequest, "Request too large")
            }
            Incoming::Truncated => {
                Response::error(ErrorCode::ParseError, "Incomplete request")
            }
            Incoming::Complete(Err(e)) => Response::error(e.code(), e.to_string()),
            Incoming::Complete(Ok(request)) => dispatch(&shared.handlers, &request),
        }
    };

    stream.write_all(&encode_response(&response))?;
    stream.flush()?;
    shared.served.fetch_add(1, Ordering::Relaxed);
    let _ = stream.shutdown(std::net::Shutdown::Write);
    Ok(())
}

/// Run the handler for `request`. A panicking handler becomes INTERNAL_ERROR.
pub fn dispatch(handlers: &HandlerTable, request: &Request) -> Response {
    let Some(handler) = handlers.get(&request.method) else {
        debug!("[IPC] Unknown method '{}'", request.method);
        return Response::error(
            ErrorCode::MethodNotFound,
            format!("Method not found: {}", request.method),
        )
        .with_id(request.id.clone());
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(request)));
    let response = match outcome {
        Ok(Ok(result)) => Response::ok(result),
        Ok(Err(e)) => {
            match e.code() {
                ErrorCode::InvalidParams => {
                    debug!("[IPC] {} rejected: {}", request.method, e)
                }
                _ => warn!("[IPC] {} failed: {}", request.method, e),
            }
            Response::error(e.code(), e.to_string())
        }
        Err(_) => {
            error!("[IPC] Handler for '{}' panicked", request.method);
            Response::error(ErrorCode::InternalError, "Internal error")
        }
    };
    response.with_id(request.id.clone())
}
