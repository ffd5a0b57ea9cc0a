//! The event dispatch contract between a connection and its consumer
// (c) 2025 droplink contributors

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::Error;

/// The capability set a consumer implements to receive decoded events from a
/// [`Connection`](crate::Connection).
///
/// The read loop drives exactly one handler, from a single task, so for a
/// given connection the callbacks arrive in strict wire order: frames are
/// dispatched one at a time, never concurrently, and
/// [`on_disconnect`](Self::on_disconnect) is always the last call.
///
/// Handlers are invoked inline by the read loop. A handler that blocks for a
/// long time stalls frame processing for its connection (and only for its
/// connection); hand work off to a channel if that matters.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Invoked once per decoded TEXT frame, in arrival order.
    async fn on_message(&self, text: String);

    /// Invoked once a FILE frame's payload has been fully written to
    /// `saved_path`. Never invoked for a partially received file.
    ///
    /// `original_name` is the name the peer declared; `saved_path` is where
    /// the bytes actually live, as chosen by
    /// [`IncomingFiles`](crate::IncomingFiles).
    async fn on_file_received(&self, original_name: String, saved_path: PathBuf);

    /// Invoked when the read loop terminates because of an error (I/O
    /// failure, truncation, protocol violation) rather than a graceful close.
    /// Always followed by [`on_disconnect`](Self::on_disconnect).
    ///
    /// The default implementation does nothing.
    async fn on_error(&self, error: &Error) {
        let _ = error;
    }

    /// Invoked exactly once when the read loop terminates, for any reason:
    /// peer closed gracefully, I/O or protocol error, or a local
    /// [`close`](crate::Connection::close) racing the loop.
    async fn on_disconnect(&self);
}
