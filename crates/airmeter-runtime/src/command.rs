//! Command channel between the control surface and the coordination loop.
//!
//! [`command_channel`] returns the two ends.  The loop owns the receiver;
//! every request-facing task holds a clone of [`CommandSender`].
//!
//! A synchronous read carries its own one-shot [`Reply`] inside the command,
//! so a response can only ever reach the requester that asked for it.  The
//! number of reads in flight is bounded by a semaphore whose permit travels
//! with the reply: it is released once the loop has answered (or dropped) the
//! request, not when the requester gives up waiting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use airmeter_types::{AirError, CommandName, Payload};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tracing::debug;

pub const DEFAULT_COMMAND_DEPTH: usize = 16;
pub const DEFAULT_MAX_PENDING_READS: usize = 1;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub type CommandReceiver = mpsc::Receiver<Command>;

/// One instruction for the coordination loop.  Consumed exactly once.
#[derive(Debug)]
pub struct Command {
    pub name: CommandName,
    pub args: BTreeMap<String, String>,
    pub reply: Option<Reply>,
}

impl Command {
    pub fn new(name: impl Into<CommandName>, args: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            args,
            reply: None,
        }
    }
}

/// The answering end of a synchronous read.
#[derive(Debug)]
pub struct Reply {
    tx: oneshot::Sender<Payload>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Reply {
    /// Deliver the payload.  Returns it back if the requester has gone away.
    pub fn send(self, payload: Payload) -> Result<(), Payload> {
        self.tx.send(payload)
    }
}

/// Cloneable submitting end of the command channel.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Command>,
    reads: Arc<Semaphore>,
}

/// Create a command channel holding up to `depth` queued commands and
/// allowing `max_pending_reads` synchronous reads at a time.
pub fn command_channel(depth: usize, max_pending_reads: usize) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    let sender = CommandSender {
        tx,
        reads: Arc::new(Semaphore::new(max_pending_reads.max(1))),
    };
    (sender, rx)
}

impl CommandSender {
    /// Enqueue a fire-and-forget command.
    ///
    /// # Errors
    ///
    /// Returns [`AirError::Channel`] if the coordination loop has stopped.
    pub async fn submit(&self, name: &str, args: BTreeMap<String, String>) -> Result<(), AirError> {
        debug!(command = name, "submitting command");
        self.tx
            .send(Command::new(name, args))
            .await
            .map_err(|_| loop_gone())
    }

    /// Ask the loop for a fresh reading and wait up to `timeout` for it.
    ///
    /// # Errors
    ///
    /// * [`AirError::Busy`] – another synchronous read is still outstanding.
    /// * [`AirError::Timeout`] – no payload arrived in time, including the
    ///   case where the sample failed and the loop dropped the reply.
    /// * [`AirError::Channel`] – the coordination loop has stopped.
    pub async fn request_reading(&self, timeout: Duration) -> Result<Payload, AirError> {
        let permit = self
            .reads
            .clone()
            .try_acquire_owned()
            .map_err(|_| AirError::Busy("another reading request is pending".to_string()))?;

        let (tx, rx) = oneshot::channel();
        let command = Command {
            name: CommandName::Reading,
            args: BTreeMap::new(),
            reply: Some(Reply {
                tx,
                _permit: Some(permit),
            }),
        };

        let exchange = async {
            self.tx.send(command).await.map_err(|_| loop_gone())?;
            rx.await.map_err(|_| AirError::Timeout(timeout))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(AirError::Timeout(timeout)),
        }
    }

    /// `true` once the loop has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn loop_gone() -> AirError {
    AirError::Channel("coordination loop is not running".to_string())
}
