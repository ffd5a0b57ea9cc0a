// (c) 2025 droplink contributors

#![allow(clippy::doc_markdown)]
//! `droplink` is a point-to-point text and file exchange engine running over a
//! single persistent bidirectional byte stream.
//!
//! The transport abstraction is "a connection": anything giving reliable,
//! ordered byte-stream delivery. TCP is the obvious realisation (see
//! [`Connection::from_tcp`]), but nothing here depends on TCP specifically;
//! any [`AsyncRead`](tokio::io::AsyncRead)/[`AsyncWrite`](tokio::io::AsyncWrite)
//! pair works, which is also how the tests drive everything through in-memory
//! pipes.
//!
//! ## What it does
//!
//! * Multiplexes two frame kinds — short text messages and arbitrary-length
//!   file payloads — over one stream. Wire format: [protocol].
//! * Runs a background read loop that demultiplexes incoming frames and fans
//!   them out to an [`EventHandler`], in strict wire order.
//! * Keeps one physical connection safe for a sender and the receive loop
//!   running concurrently: all writes are serialised so frames never
//!   interleave on the wire. See [connection].
//! * Names received files so that repeated transfers of the same name never
//!   collide or overwrite: [incoming].
//!
//! ## What it does not do
//!
//! No authentication, encryption, compression, multi-peer fan-out,
//! acknowledgments, resumable transfers, or flow control beyond what the
//! underlying stream provides. One trusted peer per connection; when a
//! connection dies, you build a new one.
//!
//! ## Sketch
//!
//! ```no_run
//! use droplink::{Connection, EventHandler};
//! use async_trait::async_trait;
//! use std::path::PathBuf;
//!
//! #[derive(Debug)]
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_message(&self, text: String) {
//!         println!("peer says: {text}");
//!     }
//!     async fn on_file_received(&self, original_name: String, saved_path: PathBuf) {
//!         println!("received {original_name} -> {}", saved_path.display());
//!     }
//!     async fn on_disconnect(&self) {
//!         println!("peer gone");
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> droplink::Result<()> {
//!     let socket = tokio::net::TcpStream::connect("192.0.2.1:4000").await?;
//!     let conn = Connection::from_tcp(socket);
//!     let loop_handle = conn.spawn_read_loop(Printer)?;
//!     conn.send_message("hello").await?;
//!     conn.send_file("Cargo.toml", None).await?;
//!     conn.close().await;
//!     loop_handle.await.expect("read loop panicked");
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod events;
pub mod incoming;
pub mod protocol;

pub use connection::{Connection, Options, ProgressFn, ReceivingStream, SendingStream};
pub use error::{Error, Result};
pub use events::EventHandler;
pub use incoming::IncomingFiles;
