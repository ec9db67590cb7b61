//! `airmeter-cockpit` – the request-facing HTTP surface.
//!
//! A small hand-rolled HTTP/1.1 server that turns requests into commands for
//! the coordination loop:
//!
//! - `GET /api/reading` asks the loop for a fresh reading and waits for it.
//! - `POST /api/shutdown` enqueues an orderly shutdown.
//! - `GET /` serves an embedded status page that polls the reading endpoint.
//!
//! # Usage
//!
//! ```rust,no_run
//! use airmeter_cockpit::{CockpitServer, DEFAULT_PORT};
//! use airmeter_runtime::command_channel;
//! use tokio::net::TcpListener;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> std::io::Result<()> {
//! let (commands, _rx) = command_channel(16, 1);
//! let listener = TcpListener::bind(("0.0.0.0", DEFAULT_PORT)).await?;
//! CockpitServer::new(commands, CancellationToken::new())
//!     .serve(listener)
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod server;

pub use server::{CockpitServer, DEFAULT_HEAD_TIMEOUT, DEFAULT_PORT};
