//! Wire protocol between sync-server and sync-client
//!
//! One persistent TCP stream per client. Control messages are single
//! UTF-8 lines; file content travels as raw bytes directly after a
//! length-prefixed `FILE` header on the same stream.
//!
//! ```text
//! // Client -> Server (once, at connect)
//! log,tmp,.git
//!
//! // Server -> Client
//! CREATE a.txt
//! FILE 2 a.txt
//! hi                      <- exactly 2 raw bytes, no terminator
//! CREATE sub/             <- trailing slash marks a directory
//! DELETE a.txt
//! MOVED_FROM old/name.txt
//! MOVED_TO new/name.txt
//! ```

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SyncError};

pub const CMD_CREATE: &str = "CREATE";
pub const CMD_DELETE: &str = "DELETE";
pub const CMD_MOVED_FROM: &str = "MOVED_FROM";
pub const CMD_MOVED_TO: &str = "MOVED_TO";
pub const CMD_FILE: &str = "FILE";

/// Default upper bound for a single control or handshake line
pub const DEFAULT_MAX_LINE_LEN: usize = 4096;

/// File payloads move in pieces of at most this many bytes, both when the
/// server copies them out and when the client reads them back in
pub const FILE_CHUNK_LEN: usize = 64 * 1024;

/// Errors in decoding a single inbound line. None of these drop the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed line: {line:?}")]
    Malformed { line: String },

    #[error("unknown command: {command}")]
    UnknownCommand { command: String },

    #[error("invalid file length {value:?} in FILE header")]
    InvalidLength { value: String },

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("file bytes received without a FILE header")]
    UnexpectedFileBytes,
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Create { path: String, is_dir: bool },
    Delete { path: String },
    MovedFrom { path: String },
    MovedTo { path: String },
    /// Announces exactly `length` raw bytes for `path` next on the stream
    FileHeader { path: String, length: u64 },
    FileBytes(Vec<u8>),
}

impl WireMessage {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Create { .. } => CMD_CREATE,
            Self::Delete { .. } => CMD_DELETE,
            Self::MovedFrom { .. } => CMD_MOVED_FROM,
            Self::MovedTo { .. } => CMD_MOVED_TO,
            Self::FileHeader { .. } | Self::FileBytes(_) => CMD_FILE,
        }
    }

    /// Relative path the message refers to, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Create { path, .. }
            | Self::Delete { path }
            | Self::MovedFrom { path }
            | Self::MovedTo { path }
            | Self::FileHeader { path, .. } => Some(path),
            Self::FileBytes(_) => None,
        }
    }

    /// Encode as a newline-terminated control line.
    /// `FileBytes` is raw payload and has no line form.
    pub fn encode_line(&self) -> Option<String> {
        let line = match self {
            Self::Create { path, is_dir: true } => format!("{} {}/\n", CMD_CREATE, path),
            Self::Create { path, is_dir: false } => format!("{} {}\n", CMD_CREATE, path),
            Self::Delete { path } => format!("{} {}\n", CMD_DELETE, path),
            Self::MovedFrom { path } => format!("{} {}\n", CMD_MOVED_FROM, path),
            Self::MovedTo { path } => format!("{} {}\n", CMD_MOVED_TO, path),
            Self::FileHeader { path, length } => format!("{} {} {}\n", CMD_FILE, length, path),
            Self::FileBytes(_) => return None,
        };
        Some(line)
    }

    /// Parse one control line (trailing newline already stripped)
    pub fn parse_line(line: &str) -> std::result::Result<Self, ProtocolError> {
        let malformed = || ProtocolError::Malformed {
            line: line.to_string(),
        };

        let (command, rest) = line.split_once(' ').ok_or_else(malformed)?;
        if rest.is_empty() {
            return Err(malformed());
        }

        match command {
            CMD_CREATE => match rest.strip_suffix('/') {
                Some("") => Err(malformed()),
                Some(dir) => Ok(Self::Create {
                    path: dir.to_string(),
                    is_dir: true,
                }),
                None => Ok(Self::Create {
                    path: rest.to_string(),
                    is_dir: false,
                }),
            },
            CMD_DELETE => Ok(Self::Delete {
                path: rest.to_string(),
            }),
            CMD_MOVED_FROM => Ok(Self::MovedFrom {
                path: rest.to_string(),
            }),
            CMD_MOVED_TO => Ok(Self::MovedTo {
                path: rest.to_string(),
            }),
            CMD_FILE => {
                let (length, path) = rest.split_once(' ').ok_or_else(malformed)?;
                if path.is_empty() {
                    return Err(malformed());
                }
                let length = length
                    .parse::<u64>()
                    .map_err(|_| ProtocolError::InvalidLength {
                        value: length.to_string(),
                    })?;
                Ok(Self::FileHeader {
                    path: path.to_string(),
                    length,
                })
            }
            other => Err(ProtocolError::UnknownCommand {
                command: other.to_string(),
            }),
        }
    }
}

/// Whether a relative path can be carried in a control line
pub fn is_frameable(path: &str) -> bool {
    !path.is_empty() && !path.contains('\n') && !path.contains('\r')
}

/// Write a control message to the stream
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &WireMessage) -> Result<()> {
    match msg {
        WireMessage::FileBytes(bytes) => writer.write_all(bytes).await?,
        other => {
            if let Some(line) = other.encode_line() {
                writer.write_all(line.as_bytes()).await?;
            }
        }
    }
    Ok(())
}

/// Outcome of reading one bounded line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    Line(String),
    /// Line was longer than the bound; it has been consumed and discarded
    TooLong,
    NotUtf8,
}

/// Read one `\n`-terminated line of at most `max_len` bytes.
///
/// Returns `Ok(None)` on a clean EOF before any byte. A final line without a
/// terminator is returned as-is. An over-long line is consumed up to its
/// terminator so the stream stays aligned.
pub async fn read_bounded_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> std::io::Result<Option<RawLine>> {
    let mut buf = Vec::new();
    let mut overflowed = false;
    let mut saw_any = false;

    loop {
        let (consumed, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            saw_any = true;
            let (chunk, consumed, done) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (&available[..pos], pos + 1, true),
                None => (available, available.len(), false),
            };
            if !overflowed {
                if buf.len() + chunk.len() > max_len {
                    overflowed = true;
                    buf.clear();
                } else {
                    buf.extend_from_slice(chunk);
                }
            }
            (consumed, done)
        };
        reader.consume(consumed);
        if done {
            break;
        }
    }

    if !saw_any {
        return Ok(None);
    }
    if overflowed {
        return Ok(Some(RawLine::TooLong));
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(match String::from_utf8(buf) {
        Ok(line) => RawLine::Line(line),
        Err(_) => RawLine::NotUtf8,
    }))
}

/// Client-side decoder: turns the inbound byte stream into `WireMessage`s.
///
/// After a `FileHeader` the following calls yield `FileBytes` chunks of at
/// most `FILE_CHUNK_LEN` bytes until the announced length is consumed. A
/// zero-length file yields one empty chunk, so every header is followed by
/// at least one `FileBytes`.
pub struct FrameReader<R> {
    reader: R,
    max_line_len: usize,
    pending_bytes: Option<u64>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_line_len: usize) -> Self {
        Self {
            reader,
            max_line_len,
            pending_bytes: None,
        }
    }

    /// Next message, `Ok(None)` at end of stream.
    ///
    /// `SyncError::Protocol` means one line was unusable and has been
    /// skipped; the reader can continue. `SyncError::Io` is fatal.
    pub async fn next_message(&mut self) -> Result<Option<WireMessage>> {
        if let Some(remaining) = self.pending_bytes.take() {
            let want = remaining.min(FILE_CHUNK_LEN as u64);
            let mut chunk = Vec::with_capacity(want as usize);
            let read = (&mut self.reader).take(want).read_to_end(&mut chunk).await? as u64;
            if read < want {
                return Err(SyncError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("stream ended {} bytes short of a file payload", remaining - read),
                )));
            }
            if remaining > want {
                self.pending_bytes = Some(remaining - want);
            }
            return Ok(Some(WireMessage::FileBytes(chunk)));
        }

        let line = match read_bounded_line(&mut self.reader, self.max_line_len).await? {
            None => return Ok(None),
            Some(RawLine::TooLong) => {
                return Err(ProtocolError::LineTooLong {
                    max: self.max_line_len,
                }
                .into())
            }
            Some(RawLine::NotUtf8) => {
                return Err(ProtocolError::Malformed {
                    line: "<non-utf8>".to_string(),
                }
                .into())
            }
            Some(RawLine::Line(line)) => line,
        };

        let msg = WireMessage::parse_line(&line)?;
        if let WireMessage::FileHeader { length, .. } = &msg {
            self.pending_bytes = Some(*length);
        }
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn reader(bytes: &[u8]) -> FrameReader<BufReader<&[u8]>> {
        FrameReader::new(BufReader::new(bytes), DEFAULT_MAX_LINE_LEN)
    }

    #[test]
    fn test_encode_lines() {
        let create = WireMessage::Create {
            path: "a.txt".to_string(),
            is_dir: false,
        };
        assert_eq!(create.encode_line().as_deref(), Some("CREATE a.txt\n"));

        let dir = WireMessage::Create {
            path: "sub".to_string(),
            is_dir: true,
        };
        assert_eq!(dir.encode_line().as_deref(), Some("CREATE sub/\n"));

        let header = WireMessage::FileHeader {
            path: "sub/a b.txt".to_string(),
            length: 12,
        };
        assert_eq!(header.encode_line().as_deref(), Some("FILE 12 sub/a b.txt\n"));

        assert!(WireMessage::FileBytes(vec![1, 2]).encode_line().is_none());
    }

    #[test]
    fn test_parse_lines() {
        assert_eq!(
            WireMessage::parse_line("MOVED_FROM old/x.txt"),
            Ok(WireMessage::MovedFrom {
                path: "old/x.txt".to_string()
            })
        );
        assert_eq!(
            WireMessage::parse_line("CREATE sub/"),
            Ok(WireMessage::Create {
                path: "sub".to_string(),
                is_dir: true
            })
        );
        assert_eq!(
            WireMessage::parse_line("FILE 0 with space.txt"),
            Ok(WireMessage::FileHeader {
                path: "with space.txt".to_string(),
                length: 0
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            WireMessage::parse_line("CREATE"),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            WireMessage::parse_line("CREATE /"),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            WireMessage::parse_line("RENAME a b"),
            Err(ProtocolError::UnknownCommand { .. })
        ));
        assert!(matches!(
            WireMessage::parse_line("FILE x a.txt"),
            Err(ProtocolError::InvalidLength { .. })
        ));
        assert!(matches!(
            WireMessage::parse_line("FILE 3"),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_frame_reader_file_payload() {
        let mut frames = reader(b"CREATE a.txt\nFILE 2 a.txt\nhiCREATE sub/\n");

        assert_eq!(
            frames.next_message().await.unwrap(),
            Some(WireMessage::Create {
                path: "a.txt".to_string(),
                is_dir: false
            })
        );
        assert_eq!(
            frames.next_message().await.unwrap(),
            Some(WireMessage::FileHeader {
                path: "a.txt".to_string(),
                length: 2
            })
        );
        assert_eq!(
            frames.next_message().await.unwrap(),
            Some(WireMessage::FileBytes(b"hi".to_vec()))
        );
        assert_eq!(
            frames.next_message().await.unwrap(),
            Some(WireMessage::Create {
                path: "sub".to_string(),
                is_dir: true
            })
        );
        assert_eq!(frames.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_reader_payload_with_newlines_and_exact_buffer_size() {
        // Payload that looks like protocol lines and fills a whole 4096 buffer
        let mut payload = b"DELETE x\n".repeat(455);
        payload.resize(4096, b'z');
        let mut stream = format!("FILE {} big.bin\n", payload.len()).into_bytes();
        stream.extend_from_slice(&payload);
        stream.extend_from_slice(b"DELETE big.bin\n");

        let mut frames = reader(&stream);
        frames.next_message().await.unwrap();
        assert_eq!(
            frames.next_message().await.unwrap(),
            Some(WireMessage::FileBytes(payload.clone()))
        );
        assert_eq!(
            frames.next_message().await.unwrap(),
            Some(WireMessage::Delete {
                path: "big.bin".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_frame_reader_splits_large_payload() {
        let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        let mut input = format!("FILE {} big.bin\n", payload.len()).into_bytes();
        input.extend_from_slice(&payload);
        input.extend_from_slice(b"DELETE gone\n");
        let mut frames = reader(&input);

        frames.next_message().await.unwrap();
        let mut chunks = Vec::new();
        while let Some(WireMessage::FileBytes(chunk)) = frames.next_message().await.unwrap() {
            chunks.push(chunk);
            if chunks.iter().map(Vec::len).sum::<usize>() == payload.len() {
                break;
            }
        }
        assert_eq!(
            chunks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![FILE_CHUNK_LEN, FILE_CHUNK_LEN, 150_000 - 2 * FILE_CHUNK_LEN]
        );
        assert_eq!(chunks.concat(), payload);
        assert_eq!(
            frames.next_message().await.unwrap(),
            Some(WireMessage::Delete {
                path: "gone".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_frame_reader_empty_file() {
        let mut frames = reader(b"FILE 0 empty\nDELETE gone\n");
        frames.next_message().await.unwrap();
        assert_eq!(
            frames.next_message().await.unwrap(),
            Some(WireMessage::FileBytes(Vec::new()))
        );
        assert_eq!(
            frames.next_message().await.unwrap(),
            Some(WireMessage::Delete {
                path: "gone".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_frame_reader_skips_bad_lines() {
        let mut frames = reader(b"garbage\nBOGUS x\nDELETE a.txt\n");
        assert!(matches!(
            frames.next_message().await,
            Err(SyncError::Protocol(ProtocolError::Malformed { .. }))
        ));
        assert!(matches!(
            frames.next_message().await,
            Err(SyncError::Protocol(ProtocolError::UnknownCommand { .. }))
        ));
        assert_eq!(
            frames.next_message().await.unwrap(),
            Some(WireMessage::Delete {
                path: "a.txt".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_frame_reader_truncated_payload_is_fatal() {
        let mut frames = reader(b"FILE 10 a.txt\nshort");
        frames.next_message().await.unwrap();
        assert!(matches!(frames.next_message().await, Err(SyncError::Io(_))));
    }

    #[tokio::test]
    async fn test_bounded_line_too_long_is_discarded() {
        let mut input = vec![b'x'; 64];
        input.extend_from_slice(b"\nDELETE a\n");
        let mut buf = BufReader::new(&input[..]);

        assert_eq!(
            read_bounded_line(&mut buf, 16).await.unwrap(),
            Some(RawLine::TooLong)
        );
        assert_eq!(
            read_bounded_line(&mut buf, 16).await.unwrap(),
            Some(RawLine::Line("DELETE a".to_string()))
        );
        assert_eq!(read_bounded_line(&mut buf, 16).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bounded_line_without_terminator() {
        let mut buf = BufReader::new(&b"log,tmp"[..]);
        assert_eq!(
            read_bounded_line(&mut buf, 64).await.unwrap(),
            Some(RawLine::Line("log,tmp".to_string()))
        );
        assert_eq!(read_bounded_line(&mut buf, 64).await.unwrap(), None);
    }

    #[test]
    fn test_is_frameable() {
        assert!(is_frameable("a b/c.txt"));
        assert!(!is_frameable("evil\nDELETE x"));
        assert!(!is_frameable(""));
    }
}
