//! Transport layer for the modem link.
//!
//! This module provides the abstraction over the byte stream to the modem.
//! Received bytes are cut into lines by a background reader task; each line,
//! or the error that ended the stream, is delivered in arrival order through
//! the channel returned by [`Transport::take_lines`].

pub mod serial;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;

/// Receiving end of a transport's line stream.
///
/// A read failure arrives as the final `Err` item; after that the channel
/// closes.
pub type LineReceiver = mpsc::Receiver<Result<String>>;

/// Trait for transport implementations.
pub trait Transport: Send + Sync {
    /// Opens the link and starts the reader task.
    fn connect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Flushes and closes the link. The reader task is stopped.
    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Writes raw bytes. Framing is the caller's business.
    fn send(&mut self, data: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Returns true if connected.
    fn is_connected(&self) -> bool;

    /// Takes the line stream of the current connection.
    ///
    /// Returns `None` if not connected or already taken.
    fn take_lines(&mut self) -> Option<LineReceiver>;
}

pub use serial::{SerialConfig, SerialTransport};
