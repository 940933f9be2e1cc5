//! # Framed control channel.
//!
//! Newline-delimited JSON over any `AsyncRead`/`AsyncWrite` pair. In
//! production the pair is the worker child's stdin/stdout pipes (master
//! side) or the process's own stdin/stdout (worker side); tests use
//! [`tokio::io::duplex`].
//!
//! ## Rules
//! - One [`ControlMessage`] per line; messages never contain raw
//!   newlines (JSON string escaping guarantees this).
//! - Per-channel FIFO: within one worker's channel, delivery order is
//!   send order. Nothing is guaranteed across different workers.
//! - Malformed lines are skipped with a warning, not fatal: a worker that
//!   accidentally prints to stdout must not take the whole channel down.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use super::message::ControlMessage;

/// Sending half of a control channel.
pub struct ControlSender<W> {
    frames: FramedWrite<W, LinesCodec>,
}

impl<W: AsyncWrite + Unpin> ControlSender<W> {
    /// Wraps a writer in line framing.
    pub fn new(writer: W) -> Self {
        Self {
            frames: FramedWrite::new(writer, LinesCodec::new()),
        }
    }

    /// Encodes and sends one message, flushing the underlying writer.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the peer end of the pipe is gone.
    pub async fn send(&mut self, msg: &ControlMessage) -> std::io::Result<()> {
        let line = serde_json::to_string(msg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.frames
            .send(line)
            .await
            .map_err(std::io::Error::other)
    }
}

/// Receiving half of a control channel.
pub struct ControlReceiver<R> {
    frames: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> ControlReceiver<R> {
    /// Wraps a reader in line framing.
    pub fn new(reader: R) -> Self {
        Self {
            frames: FramedRead::new(reader, LinesCodec::new()),
        }
    }

    /// Receives the next message.
    ///
    /// Returns `None` when the peer closed the pipe. Malformed lines are
    /// skipped with a stderr warning.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        loop {
            match self.frames.next().await? {
                Ok(line) => match serde_json::from_str::<ControlMessage>(&line) {
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        eprintln!("[clustervisor] skipping malformed control line: {e}");
                    }
                },
                Err(e) => {
                    eprintln!("[clustervisor] control channel framing error: {e}");
                    return None;
                }
            }
        }
    }
}
