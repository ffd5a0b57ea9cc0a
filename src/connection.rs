//! The connection engine: framed send discipline, background receive loop, lifecycle
// (c) 2025 droplink contributors
//!
//! A [`Connection`] wraps one already-established bidirectional byte stream
//! and multiplexes two frame kinds over it (see [protocol](crate::protocol)).
//! Its lifecycle is `OPEN → ACTIVE (read loop running) → CLOSED`; `CLOSED` is
//! terminal and absorbing. A new link means a new `Connection`.
//!
//! Concurrency model, in brief:
//! * The write side is guarded by one async mutex. The critical section
//!   spans an entire frame (header plus payload), so two concurrent send
//!   calls can never interleave their bytes on the wire.
//! * The read side has a single owner, the background loop spawned by
//!   [`spawn_read_loop`](Connection::spawn_read_loop); it needs no locking.
//! * `closed` is the only state shared between the loop and caller threads:
//!   an atomic flag, set exactly once by a compare-and-set in
//!   [`close`](Connection::close).
//!
//! Known limitations, by design of the underlying protocol:
//! * [`send_file`](Connection::send_file) captures the file length once, up
//!   front. If the file changes size mid-transfer the mismatch is detected
//!   only as a short or long read, the connection is poisoned, and the peer
//!   is left mid-frame. There is no abort or resume frame.
//! * Stream-level failures are never retried here; retry policy belongs to
//!   the caller, on a fresh connection.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::events::EventHandler;
use crate::incoming::IncomingFiles;
use crate::protocol::{self, Tag, DEFAULT_MAX_NAME_BYTES, DEFAULT_MAX_TEXT_BYTES};

/// Fixed buffer size for streaming file payloads, both directions
const TRANSFER_CHUNK: usize = 8192;

/// Marker trait for the outbound half of a connection's stream
pub trait SendingStream: AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncWrite + Send + Unpin + 'static> SendingStream for T {}

/// Marker trait for the inbound half of a connection's stream
pub trait ReceivingStream: AsyncRead + Send + Unpin + 'static {}
impl<T: AsyncRead + Send + Unpin + 'static> ReceivingStream for T {}

/// Per-chunk progress callback for [`Connection::send_file`]: arguments are
/// cumulative bytes sent and the total declared length.
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Tuning knobs and policy for one connection.
///
/// This crate has no configuration files or CLI of its own; consumers
/// construct one of these (or take the defaults) and pass it to
/// [`Connection::with_options`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Refuse inbound (and outbound) TEXT payloads longer than this
    pub max_text_bytes: u32,
    /// Refuse FILE frame name fields longer than this
    pub max_name_bytes: u32,
    /// Where received files are written; see [`IncomingFiles`]
    pub incoming_dir: std::path::PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_text_bytes: DEFAULT_MAX_TEXT_BYTES,
            max_name_bytes: DEFAULT_MAX_NAME_BYTES,
            incoming_dir: crate::incoming::DEFAULT_INCOMING_DIR.into(),
        }
    }
}

/// State shared between caller threads and the background read loop
struct Shared<S: SendingStream> {
    writer: Mutex<S>,
    closed: AtomicBool,
    cancel: CancellationToken,
    options: Options,
    incoming: IncomingFiles,
}

/// One live peer link: owns the stream, serialises outbound frames, runs the
/// inbound demultiplexing loop.
///
/// `Connection` is `&self` throughout; wrap it in an [`Arc`] to send from
/// several tasks concurrently while the read loop runs.
pub struct Connection<S: SendingStream, R: ReceivingStream> {
    shared: Arc<Shared<S>>,
    // Taken (once) by spawn_read_loop; enforces the single-loop invariant.
    reader: StdMutex<Option<R>>,
}

impl Connection<tokio::net::tcp::OwnedWriteHalf, tokio::net::tcp::OwnedReadHalf> {
    /// Convenience constructor around a connected TCP socket
    #[must_use]
    pub fn from_tcp(stream: TcpStream) -> Self {
        Self::from_tcp_with_options(stream, Options::default())
    }

    /// As [`from_tcp`](Self::from_tcp), with explicit [`Options`]
    #[must_use]
    pub fn from_tcp_with_options(stream: TcpStream, options: Options) -> Self {
        let (recv, send) = stream.into_split();
        Self::with_options(send, recv, options)
    }
}

impl<S: SendingStream, R: ReceivingStream> Connection<S, R> {
    /// Wraps an established stream pair with default [`Options`]
    #[must_use]
    pub fn new(send: S, recv: R) -> Self {
        Self::with_options(send, recv, Options::default())
    }

    /// Wraps an established stream pair
    #[must_use]
    pub fn with_options(send: S, recv: R, options: Options) -> Self {
        let incoming = IncomingFiles::new(options.incoming_dir.clone());
        Self {
            shared: Arc::new(Shared {
                writer: Mutex::new(send),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                options,
                incoming,
            }),
            reader: StdMutex::new(Some(recv)),
        }
    }

    /// Non-blocking lifecycle query
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// A write failed partway through a frame. The stream can no longer be
    /// trusted to be at a frame boundary, so the connection becomes terminal.
    fn poison(&self, e: std::io::Error) -> Error {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.cancel.cancel();
        Error::Io(e)
    }

    /// Encodes and writes one TEXT frame, flushing before return so no
    /// partial frame remains buffered.
    ///
    /// Safe to call from any task at any time; concurrent sends are
    /// serialised, never interleaved.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        self.ensure_open()?;
        let frame = protocol::encode_text(text, self.shared.options.max_text_bytes)?;
        let mut writer = self.shared.writer.lock().await;
        // close() may have beaten us to the lock
        self.ensure_open()?;
        trace!("send text frame ({} bytes)", frame.len());
        writer.write_all(&frame).await.map_err(|e| self.poison(e))?;
        writer.flush().await.map_err(|e| self.poison(e))?;
        Ok(())
    }

    /// Streams one file as a FILE frame: header first, then the payload in
    /// fixed-size chunks, all under the same write lock as
    /// [`send_message`](Self::send_message) so nothing can interleave.
    ///
    /// `progress`, if supplied, is invoked after each chunk with cumulative
    /// bytes sent and the total declared length.
    ///
    /// The file's length is captured once, before the header goes out; see
    /// the module docs for what happens if the file changes underneath us.
    ///
    /// # Return
    /// The number of payload bytes sent.
    pub async fn send_file<P: AsRef<Path>>(&self, path: P, progress: Option<ProgressFn>) -> Result<u64> {
        let path = path.as_ref();
        self.ensure_open()?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "source path has no usable file name",
                ))
            })?;
        let mut file = fs::File::open(path).await?;
        let meta = file.metadata().await?;
        if meta.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "source is a directory",
            )));
        }
        let total = meta.len();
        let header =
            protocol::encode_file_header(name, total, self.shared.options.max_name_bytes)?;

        let mut writer = self.shared.writer.lock().await;
        self.ensure_open()?;
        debug!("send file {name:?} ({total} bytes)");
        writer.write_all(&header).await.map_err(|e| self.poison(e))?;

        let mut sent = 0u64;
        let mut buf = vec![0u8; TRANSFER_CHUNK];
        while sent < total {
            // Cancellation point between chunks; mid-frame, so the
            // connection is already condemned if this fires.
            if self.is_closed() {
                return Err(Error::Closed);
            }
            #[allow(clippy::cast_possible_truncation)] // bounded by TRANSFER_CHUNK
            let want = (total - sent).min(TRANSFER_CHUNK as u64) as usize;
            let got = file.read(&mut buf[..want]).await.map_err(|e| self.poison(e))?;
            if got == 0 {
                // We promised `total` bytes in the header and cannot deliver.
                return Err(self.poison(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "source file shrank during transfer",
                )));
            }
            writer
                .write_all(&buf[..got])
                .await
                .map_err(|e| self.poison(e))?;
            sent += got as u64;
            if let Some(cb) = &progress {
                cb(sent, total);
            }
        }
        writer.flush().await.map_err(|e| self.poison(e))?;
        trace!("file payload complete");
        Ok(total)
    }

    /// Starts the background receive loop. Returns immediately; the loop
    /// runs on its own task until the stream closes or an unrecoverable
    /// error occurs, then invokes `handler.on_disconnect` exactly once (after
    /// `on_error`, if the termination was an error) and closes the
    /// connection.
    ///
    /// At most one loop runs per connection; a second call fails with
    /// [`Error::ReadLoopAlreadyRunning`].
    pub fn spawn_read_loop<H: EventHandler>(&self, handler: H) -> Result<JoinHandle<()>> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::ReadLoopAlreadyRunning)?;
        let shared = Arc::clone(&self.shared);
        Ok(tokio::spawn(read_loop(shared, reader, handler)))
    }

    /// Marks the connection terminal and releases the write side of the
    /// stream. Idempotent: safe to call repeatedly and from any task,
    /// including concurrently with the read loop (which observes the close
    /// and exits).
    pub async fn close(&self) {
        if self
            .shared
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!("closing connection");
        self.shared.cancel.cancel();
        let mut writer = self.shared.writer.lock().await;
        // Best effort; the stream may already be gone.
        let _ = writer.shutdown().await;
    }
}

impl<S: SendingStream, R: ReceivingStream> fmt::Debug for Connection<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// The background receive loop. Decodes one frame at a time, dispatches to
/// the handler, and owns the terminal callback sequence.
async fn read_loop<S, R, H>(shared: Arc<Shared<S>>, mut reader: R, handler: H)
where
    S: SendingStream,
    R: ReceivingStream,
    H: EventHandler,
{
    let outcome = drive(&shared, &mut reader, &handler).await;
    match &outcome {
        Ok(()) => debug!("peer closed the stream"),
        Err(Error::Closed) => debug!("read loop observed local close"),
        Err(e) => {
            warn!("read loop terminated: {e}");
            handler.on_error(e).await;
        }
    }
    // Idempotent against a concurrent explicit close()
    if shared
        .closed
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        shared.cancel.cancel();
        let mut writer = shared.writer.lock().await;
        let _ = writer.shutdown().await;
    }
    handler.on_disconnect().await;
}

/// Frame pump. `Ok(())` is a graceful peer close; `Err(Closed)` is a local
/// close racing the loop; anything else is a real failure.
async fn drive<S, R, H>(shared: &Shared<S>, reader: &mut R, handler: &H) -> Result<()>
where
    S: SendingStream,
    R: ReceivingStream,
    H: EventHandler,
{
    loop {
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let maybe_tag = tokio::select! {
            () = shared.cancel.cancelled() => return Err(Error::Closed),
            t = protocol::read_tag(reader) => t?,
        };
        let Some(tag) = maybe_tag else {
            return Ok(());
        };
        match tag {
            Tag::Text => {
                let text =
                    protocol::read_string(reader, shared.options.max_text_bytes, "text payload")
                        .await?;
                trace!("text frame ({} bytes)", text.len());
                handler.on_message(text).await;
            }
            Tag::File => {
                let (name, size) =
                    protocol::read_file_header(reader, shared.options.max_name_bytes).await?;
                debug!("file frame {name:?} ({size} bytes)");
                let dest = shared.incoming.name_for(&name).await?;
                if let Err(e) = receive_payload(reader, &shared.cancel, &dest, size).await {
                    warn!("abandoning partial file at {}", dest.display());
                    return Err(e);
                }
                handler.on_file_received(name, dest).await;
            }
            Tag::Unknown(t) => {
                // Forward-compatibility placeholder, not an error
                warn!("ignoring unknown frame tag {t}");
            }
        }
    }
}

/// Copies exactly `declared` payload bytes from the stream into `dest`.
async fn receive_payload<R>(
    reader: &mut R,
    cancel: &CancellationToken,
    dest: &Path,
    declared: u64,
) -> Result<()>
where
    R: ReceivingStream,
{
    let mut file = fs::File::create(dest).await?;
    let mut remaining = declared;
    let mut buf = vec![0u8; TRANSFER_CHUNK];
    while remaining > 0 {
        #[allow(clippy::cast_possible_truncation)] // bounded by TRANSFER_CHUNK
        let want = remaining.min(TRANSFER_CHUNK as u64) as usize;
        let got = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Closed),
            r = reader.read(&mut buf[..want]) => r?,
        };
        if got == 0 {
            return Err(Error::TruncatedTransfer {
                declared,
                received: declared - remaining,
            });
        }
        file.write_all(&buf[..got]).await?;
        remaining -= got as u64;
    }
    file.flush().await?;
    trace!("payload written to {}", dest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Connection, Options};
    use crate::error::Error;
    use crate::events::EventHandler;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tokio::io::{duplex, split};
    use tokio::sync::mpsc;

    struct Discard;
    #[async_trait]
    impl EventHandler for Discard {
        async fn on_message(&self, _text: String) {}
        async fn on_file_received(&self, _original_name: String, _saved_path: PathBuf) {}
        async fn on_disconnect(&self) {}
    }

    struct NotifyDisconnect(mpsc::UnboundedSender<&'static str>);
    #[async_trait]
    impl EventHandler for NotifyDisconnect {
        async fn on_message(&self, _text: String) {}
        async fn on_file_received(&self, _original_name: String, _saved_path: PathBuf) {}
        async fn on_error(&self, _error: &Error) {
            self.0.send("error").unwrap();
        }
        async fn on_disconnect(&self) {
            self.0.send("disconnect").unwrap();
        }
    }

    fn pair() -> (
        Connection<impl super::SendingStream, impl super::ReceivingStream>,
        Connection<impl super::SendingStream, impl super::ReceivingStream>,
    ) {
        let (a, b) = duplex(1024);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        (Connection::new(aw, ar), Connection::new(bw, br))
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (alice, _bob) = pair();
        alice.close().await;
        assert!(alice.is_closed());
        let e = alice
            .send_message("too late")
            .await
            .expect_err("an error was expected");
        assert!(matches!(e, Error::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (alice, _bob) = pair();
        alice.close().await;
        alice.close().await;
        assert!(alice.is_closed());
    }

    #[tokio::test]
    async fn second_read_loop_is_refused() {
        let (alice, _bob) = pair();
        let handle = alice.spawn_read_loop(Discard).unwrap();
        let e = alice
            .spawn_read_loop(Discard)
            .expect_err("an error was expected");
        assert!(matches!(e, Error::ReadLoopAlreadyRunning));
        alice.close().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn local_close_stops_a_blocked_loop_without_error() {
        let (alice, _bob) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = alice.spawn_read_loop(NotifyDisconnect(tx)).unwrap();
        // The loop is blocked waiting for a tag; close() must wake it.
        alice.close().await;
        handle.await.unwrap();
        assert_eq!(rx.recv().await, Some("disconnect"));
        assert!(rx.try_recv().is_err(), "no error callback expected");
    }

    #[tokio::test]
    async fn oversized_outbound_message_is_rejected() {
        let (a, b) = duplex(1024);
        let (ar, aw) = split(a);
        let options = Options {
            max_text_bytes: 8,
            ..Options::default()
        };
        let alice = Connection::with_options(aw, ar, options);
        let e = alice
            .send_message("this will not fit in eight bytes")
            .await
            .expect_err("an error was expected");
        assert!(matches!(e, Error::ProtocolViolation(_)));
        // connection is still usable: the frame never started
        alice.send_message("ok").await.unwrap();
        drop(b);
    }
}
