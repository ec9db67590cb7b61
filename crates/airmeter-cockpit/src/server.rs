//! [`CockpitServer`] – request-facing HTTP front end for the agent.
//!
//! The caller binds the listener (`0.0.0.0:8000` by default, see
//! [`DEFAULT_PORT`]) and hands it to [`CockpitServer::serve`].
//! One request per connection; every response closes the socket.
//!
//! | Route               | Method   | Result                                              |
//! |---------------------|----------|-----------------------------------------------------|
//! | `/`                 | GET/HEAD | embedded status page                                |
//! | `/api/reading`      | GET      | 200 reading JSON, 408 timeout, 429 busy, 503 down   |
//! | `/api/shutdown`     | POST     | 200, shutdown enqueued; 503 when the loop is gone   |
//! | `/api/{other}`      | any      | 400                                                 |
//! | anything else       | any      | 404                                                 |
//! | any path            | OPTIONS  | 204 CORS preflight                                  |

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use airmeter_runtime::CommandSender;
use airmeter_runtime::command::DEFAULT_READ_TIMEOUT;
use airmeter_types::AirError;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PORT: u16 = 8000;

/// Time a client gets to send its complete request head.
pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(15);

const MAX_HEAD_BYTES: usize = 8 * 1024;

const INDEX_HTML: &str = include_str!("index.html");

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

pub struct CockpitServer {
    commands: CommandSender,
    read_timeout: Duration,
    head_timeout: Duration,
    shutdown: CancellationToken,
}

impl CockpitServer {
    pub fn new(commands: CommandSender, shutdown: CancellationToken) -> Self {
        Self {
            commands,
            read_timeout: DEFAULT_READ_TIMEOUT,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
            shutdown,
        }
    }

    /// How long `GET /api/reading` waits for the loop.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_head_timeout(mut self, timeout: Duration) -> Self {
        self.head_timeout = timeout;
        self
    }

    /// Serve an already-bound listener until the shutdown token is cancelled.
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "http server listening");
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("http server stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let commands = self.commands.clone();
                        let read_timeout = self.read_timeout;
                        let head_timeout = self.head_timeout;
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, peer, commands, read_timeout, head_timeout).await
                            {
                                debug!(%peer, error = %e, "http connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "http accept error"),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    commands: CommandSender,
    read_timeout: Duration,
    head_timeout: Duration,
) -> std::io::Result<()> {
    let started = Instant::now();

    let head = match tokio::time::timeout(head_timeout, read_head(&mut stream)).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(%peer, "request head not received in time; closing");
            return Ok(());
        }
    };

    let (method, path, response) = match parse_request_line(&head) {
        Some((method, path)) => {
            let response = route(&method, &path, &commands, read_timeout).await;
            (method, path, response)
        }
        None => (
            String::from("-"),
            String::from("-"),
            Response::error(400, "malformed request"),
        ),
    };

    stream.write_all(&response.to_bytes(method == "HEAD")).await?;
    stream.shutdown().await?;

    info!(
        %peer,
        method = %method,
        path = %path,
        status = response.status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "http request"
    );
    Ok(())
}

/// Read until the blank line ending the head.  A body, if any, is ignored.
async fn read_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_HEAD_BYTES {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_request_line(head: &str) -> Option<(String, String)> {
    let mut parts = head.lines().next()?.split_whitespace();
    let method = parts.next()?.to_ascii_uppercase();
    let target = parts.next()?;
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let path = target.split('?').next().unwrap_or(target);
    Some((method, path.to_string()))
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

pub(crate) async fn route(
    method: &str,
    path: &str,
    commands: &CommandSender,
    read_timeout: Duration,
) -> Response {
    if method == "OPTIONS" {
        return Response::new(204, "text/plain; charset=utf-8", Vec::new());
    }

    match path {
        "/" | "/index.html" => match method {
            "GET" | "HEAD" => Response::new(200, "text/html; charset=utf-8", INDEX_HTML.as_bytes().to_vec()),
            _ => Response::error(400, "method not allowed"),
        },
        "/api/reading" => match method {
            "GET" => match commands.request_reading(read_timeout).await {
                Ok(payload) => Response::new(200, "application/json", payload.into_bytes()),
                Err(e) => Response::from_error(&e),
            },
            _ => Response::error(400, "reading requires GET"),
        },
        "/api/shutdown" => match method {
            "POST" => match commands.submit("shutdown", BTreeMap::new()).await {
                Ok(()) => Response::json(200, &json!({ "status": "shutting down" })),
                Err(e) => Response::from_error(&e),
            },
            _ => Response::error(400, "shutdown requires POST"),
        },
        p if p.starts_with("/api/") => {
            let cmd = &p["/api/".len()..];
            Response::error(400, &format!("unrecognized command '{cmd}'"))
        }
        _ => Response::error(404, "not found"),
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    fn new(status: u16, content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }

    fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, "application/json", value.to_string().into_bytes())
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, &json!({ "error": message }))
    }

    fn from_error(e: &AirError) -> Self {
        let status = match e {
            AirError::Timeout(_) => 408,
            AirError::Busy(_) => 429,
            AirError::Channel(_) => 503,
            _ => 500,
        };
        Self::error(status, &e.to_string())
    }

    fn to_bytes(&self, head_only: bool) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Headers: X-Requested-With, Auth-Token\r\n\
             Access-Control-Allow-Methods: GET, HEAD, OPTIONS\r\n\
             Connection: close\r\n\
             \r\n",
            self.status,
            reason(self.status),
            self.content_type,
            self.body.len(),
        )
        .into_bytes();
        if !head_only {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
