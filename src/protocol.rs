//! Wire protocol definitions and the byte-exact frame codec
// (c) 2025 droplink contributors
//!
//! # On-wire framing
//!
//! Every frame is a single tag byte followed by a tag-specific payload:
//!
//! ```text
//! frame := tag:u8 payload
//! TEXT (tag=1) payload := length:u32(BE) bytes:UTF-8[length]
//! FILE (tag=2) payload := nameLen:u32(BE) name:UTF-8[nameLen] size:u64(BE) data:byte[size]
//! ```
//!
//! All integers are big-endian and unsigned. A `size` of 0 is a legal,
//! zero-length file.
//!
//! Frames are not self-describing beyond their tag, so the reader must stay
//! byte-exact: a FILE payload is complete only once exactly `size` bytes have
//! been consumed. End-of-stream is a graceful close *only* when it occurs at
//! the tag boundary ([`read_tag`] returns `None`); anywhere else it is a
//! truncation error.
//!
//! # Length bounds
//!
//! Length prefixes arrive from the network and are checked against a caller
//! supplied bound *before* any allocation. An oversized length fails with
//! [`Error::ProtocolViolation`]; see [`Options`](crate::Options) for the
//! defaults.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Frame tag for a short text message
pub const TAG_TEXT: u8 = 1;
/// Frame tag for a named file payload
pub const TAG_FILE: u8 = 2;

/// Default bound for a TEXT payload (1 MiB)
pub const DEFAULT_MAX_TEXT_BYTES: u32 = 1_048_576;
/// Default bound for a FILE frame's name field
pub const DEFAULT_MAX_NAME_BYTES: u32 = 1024;

/// A decoded frame tag.
///
/// Unrecognised tag values decode to [`Tag::Unknown`]; the read loop skips
/// them as a forward-compatibility placeholder rather than treating them as
/// fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Text message frame follows
    Text,
    /// File transfer frame follows
    File,
    /// Tag byte we do not recognise
    Unknown(u8),
}

impl From<u8> for Tag {
    fn from(value: u8) -> Self {
        match value {
            TAG_TEXT => Self::Text,
            TAG_FILE => Self::File,
            other => Self::Unknown(other),
        }
    }
}

/// Bound-checks a length field that is about to go on the wire.
///
/// # Return
/// The length as a `u32`, ready for encoding.
fn check_length(len: usize, bound: u32, what: &str) -> Result<u32> {
    if len > bound as usize {
        return Err(Error::ProtocolViolation(format!(
            "{what} length {len} exceeds limit {bound}"
        )));
    }
    #[allow(clippy::cast_possible_truncation)] // just checked against a u32 bound
    Ok(len as u32)
}

/// Encodes a complete TEXT frame into a buffer.
pub fn encode_text(message: &str, max_text_bytes: u32) -> Result<BytesMut> {
    let len = check_length(message.len(), max_text_bytes, "text payload")?;
    let mut buf = BytesMut::with_capacity(message.len() + 5);
    buf.put_u8(TAG_TEXT);
    buf.put_u32(len);
    buf.put_slice(message.as_bytes());
    Ok(buf)
}

/// Encodes a FILE frame header (tag, name, declared size) into a buffer.
///
/// The payload bytes are streamed separately by the sender, never buffered
/// here.
pub fn encode_file_header(name: &str, size: u64, max_name_bytes: u32) -> Result<BytesMut> {
    let len = check_length(name.len(), max_name_bytes, "file name")?;
    let mut buf = BytesMut::with_capacity(name.len() + 13);
    buf.put_u8(TAG_FILE);
    buf.put_u32(len);
    buf.put_slice(name.as_bytes());
    buf.put_u64(size);
    Ok(buf)
}

/// End-of-stream mid-frame is a truncation, anything else an I/O failure.
fn map_mid_frame_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::TruncatedFrame
    } else {
        Error::Io(e)
    }
}

/// Reads one frame tag.
///
/// # Return
/// `None` on a clean end-of-stream. This read is the only point at which a
/// peer-initiated graceful close can be observed; EOF during any other decode
/// is an error.
pub async fn read_tag<R>(reader: &mut R) -> Result<Option<Tag>>
where
    R: AsyncRead + Unpin,
{
    match reader.read_u8().await {
        Ok(byte) => Ok(Some(Tag::from(byte))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Reads one length-prefixed UTF-8 string.
///
/// Fails with [`Error::ProtocolViolation`] if the declared length exceeds
/// `bound` (checked before allocating) or the bytes are not valid UTF-8, and
/// with [`Error::TruncatedFrame`] if the stream ends early.
pub async fn read_string<R>(reader: &mut R, bound: u32, what: &str) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await.map_err(map_mid_frame_error)?;
    if len > bound {
        return Err(Error::ProtocolViolation(format!(
            "{what} length {len} exceeds limit {bound}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    let _ = reader
        .read_exact(&mut buf)
        .await
        .map_err(map_mid_frame_error)?;
    String::from_utf8(buf)
        .map_err(|_| Error::ProtocolViolation(format!("{what} is not valid UTF-8")))
}

/// Reads a FILE frame header (everything after the tag, before the payload).
///
/// # Return
/// The declared file name and payload size. The caller is responsible for
/// consuming exactly `size` payload bytes before reading the next tag.
pub async fn read_file_header<R>(reader: &mut R, max_name_bytes: u32) -> Result<(String, u64)>
where
    R: AsyncRead + Unpin,
{
    let name = read_string(reader, max_name_bytes, "file name").await?;
    let size = reader.read_u64().await.map_err(map_mid_frame_error)?;
    Ok((name, size))
}

#[cfg(test)]
mod tests {
    use super::{
        encode_file_header, encode_text, read_file_header, read_string, read_tag, Tag, TAG_FILE,
        TAG_TEXT,
    };
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    #[test]
    fn text_frame_layout() {
        let buf = encode_text("hi", 1024).unwrap();
        assert_eq!(&buf[..], &[TAG_TEXT, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn file_header_layout() {
        let buf = encode_file_header("a.txt", 0x1_0000_0001, 1024).unwrap();
        let mut expected = vec![TAG_FILE, 0, 0, 0, 5];
        expected.extend_from_slice(b"a.txt");
        expected.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 1]);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn encode_bounds() {
        let _ = encode_text("hello", 4).expect_err("an error was expected");
        let _ = encode_file_header("hello.bin", 0, 4).expect_err("an error was expected");
    }

    #[tokio::test]
    async fn text_roundtrip() {
        let buf = encode_text("bonjour à tous", 1024).unwrap();
        let mut wire: &[u8] = &buf;
        let tag = read_tag(&mut wire).await.unwrap();
        assert_eq!(tag, Some(Tag::Text));
        let text = read_string(&mut wire, 1024, "text payload").await.unwrap();
        assert_eq!(text, "bonjour à tous");
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn file_header_roundtrip() {
        let buf = encode_file_header("report.pdf", 0, 1024).unwrap();
        let mut wire: &[u8] = &buf;
        let tag = read_tag(&mut wire).await.unwrap();
        assert_eq!(tag, Some(Tag::File));
        let (name, size) = read_file_header(&mut wire, 1024).await.unwrap();
        assert_eq!(name, "report.pdf");
        assert_eq!(size, 0);
    }

    #[tokio::test]
    async fn eof_at_tag_boundary_is_graceful() {
        let mut wire: &[u8] = &[];
        assert_eq!(read_tag(&mut wire).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_tag_decodes() {
        let mut wire: &[u8] = &[42];
        assert_eq!(read_tag(&mut wire).await.unwrap(), Some(Tag::Unknown(42)));
    }

    #[tokio::test]
    async fn truncated_string_payload() {
        // declares 10 bytes, provides 3
        let mut wire: &[u8] = &[0, 0, 0, 10, b'a', b'b', b'c'];
        let e = read_string(&mut wire, 1024, "text payload")
            .await
            .expect_err("an error was expected");
        assert!(matches!(e, Error::TruncatedFrame));
    }

    #[tokio::test]
    async fn truncated_length_prefix() {
        let mut wire: &[u8] = &[0, 0];
        let e = read_string(&mut wire, 1024, "text payload")
            .await
            .expect_err("an error was expected");
        assert!(matches!(e, Error::TruncatedFrame));
    }

    #[tokio::test]
    async fn oversized_length_is_a_violation() {
        // a 256 MiB declared length must be rejected before allocation
        let mut wire: &[u8] = &[0x10, 0, 0, 0];
        let e = read_string(&mut wire, 1024, "text payload")
            .await
            .expect_err("an error was expected");
        assert!(matches!(e, Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_violation() {
        let mut wire: &[u8] = &[0, 0, 0, 2, 0xff, 0xfe];
        let e = read_string(&mut wire, 1024, "text payload")
            .await
            .expect_err("an error was expected");
        assert!(matches!(e, Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn truncated_file_size_field() {
        // valid name, then only half of the u64 size
        let mut wire: &[u8] = &[0, 0, 0, 1, b'f', 0, 0, 0];
        let e = read_file_header(&mut wire, 1024)
            .await
            .expect_err("an error was expected");
        assert!(matches!(e, Error::TruncatedFrame));
    }
}
