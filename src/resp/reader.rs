//! RESP frame reader.
//!
//! Reads one complete RESP object and returns the exact bytes that framed
//! it on the wire, including type byte, length headers and all CRLFs.
//! Arrays are never decoded into structured values; the proxy forwards the
//! wire bytes untouched.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

#[derive(Debug, Error)]
pub enum RespError {
    /// Clean end of stream at a message boundary.
    #[error("connection closed")]
    Eof,
    /// Stream ended in the middle of an object.
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("read deadline exceeded")]
    Timeout,
    #[error("invalid RESP syntax: {0}")]
    InvalidSyntax(&'static str),
    /// A command helper (AUTH, SELECT) got something other than `+OK`.
    #[error("{0}")]
    UnexpectedReply(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct RespReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> RespReader<R> {
    pub fn new(reader: R) -> Self {
        RespReader {
            inner: BufReader::new(reader),
        }
    }

    /// Read the next complete RESP object.
    ///
    /// Nested arrays are handled with a pending-object counter instead of
    /// recursion: an `*N` header just adds N objects to read.
    pub async fn read_object(&mut self) -> Result<Vec<u8>, RespError> {
        let mut buf = Vec::new();
        let mut pending: usize = 1;

        while pending > 0 {
            pending -= 1;
            let line_start = buf.len();
            let n = self.inner.read_until(b'\n', &mut buf).await?;
            if n == 0 {
                return Err(if buf.is_empty() {
                    RespError::Eof
                } else {
                    RespError::UnexpectedEof
                });
            }
            if buf.last() != Some(&b'\n') {
                return Err(RespError::UnexpectedEof);
            }
            if buf.len() < line_start + 2 || buf[buf.len() - 2] != b'\r' {
                return Err(RespError::InvalidSyntax("line not terminated with CRLF"));
            }

            let header = &buf[line_start..buf.len() - 2];
            let Some(&type_byte) = header.first() else {
                return Err(RespError::InvalidSyntax("empty line"));
            };
            match type_byte {
                b'+' | b'-' | b':' => {}
                b'$' => {
                    let len = parse_length(&header[1..])?;
                    if len >= 0 {
                        // Payload plus its trailing CRLF.
                        let start = buf.len();
                        buf.resize(start + len as usize + 2, 0);
                        self.inner
                            .read_exact(&mut buf[start..])
                            .await
                            .map_err(eof_as_truncation)?;
                        if !buf.ends_with(b"\r\n") {
                            return Err(RespError::InvalidSyntax(
                                "bulk string not terminated with CRLF",
                            ));
                        }
                    }
                }
                b'*' => {
                    let len = parse_length(&header[1..])?;
                    if len > 0 {
                        pending += len as usize;
                    }
                }
                _ => return Err(RespError::InvalidSyntax("unknown type byte")),
            }
        }

        Ok(buf)
    }
}

/// Length headers allow -1 (null bulk string / null array) but nothing
/// below it.
fn parse_length(digits: &[u8]) -> Result<i64, RespError> {
    let len = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(RespError::InvalidSyntax("unparseable length header"))?;
    if len < -1 {
        return Err(RespError::InvalidSyntax("negative length header"));
    }
    Ok(len)
}

fn eof_as_truncation(err: io::Error) -> RespError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        RespError::UnexpectedEof
    } else {
        RespError::Io(err)
    }
}
