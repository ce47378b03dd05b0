//! RESP-aware duplex connection wrapper.
//!
//! Wraps any byte stream (plain TCP, Unix socket, TLS) with a framed RESP
//! reader, a buffered writer and an optional per-read deadline. The same
//! type serves both sides of the proxy: client connections read with no
//! deadline, uplink connections read under `read_time_limit_ms`.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tracing::info;

use super::message::Msg;
use super::reader::{RespError, RespReader};

/// Any duplex byte stream the proxy can carry RESP over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type IoStream = Box<dyn AsyncStream>;

pub struct Conn {
    reader: RespReader<ReadHalf<IoStream>>,
    writer: BufWriter<WriteHalf<IoStream>>,
    peer: String,
    read_time_limit: Option<Duration>,
    log_messages: bool,
}

impl Conn {
    /// `read_time_limit_ms == 0` disables the read deadline.
    pub fn new(stream: IoStream, peer: String, read_time_limit_ms: u64, log_messages: bool) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Conn {
            reader: RespReader::new(read_half),
            writer: BufWriter::new(write_half),
            peer,
            read_time_limit: (read_time_limit_ms > 0)
                .then(|| Duration::from_millis(read_time_limit_ms)),
            log_messages,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), RespError> {
        if self.log_messages {
            self.log_message(false, data);
        }
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_msg(&mut self, msg: &Msg) -> Result<(), RespError> {
        self.write(msg.data()).await
    }

    /// Read one RESP message, applying the read deadline if configured.
    pub async fn read_msg(&mut self) -> Result<Msg, RespError> {
        let limit = self.read_time_limit;
        let result = match limit {
            Some(limit) => match timeout(limit, self.reader.read_object()).await {
                Ok(res) => res,
                Err(_) => Err(RespError::Timeout),
            },
            None => self.reader.read_object().await,
        };
        if self.log_messages {
            match &result {
                Ok(data) => self.log_message(true, data),
                Err(err) => self.log_message(true, format!("err: {}", err).as_bytes()),
            }
        }
        result.map(Msg::new)
    }

    /// One request-reply round trip.
    pub async fn call(&mut self, req: &Msg) -> Result<Msg, RespError> {
        self.write_msg(req).await?;
        self.read_msg().await
    }

    /// Send `AUTH <pass>` and demand `+OK`.
    pub async fn authenticate(&mut self, pass: &str) -> Result<(), RespError> {
        let reply = self.call(&Msg::from_args(&["AUTH", pass])).await?;
        if !reply.is_ok() {
            return Err(RespError::UnexpectedReply(format!(
                "authentication error: server responded with '{}'",
                reply
            )));
        }
        Ok(())
    }

    /// Send `SELECT <db>` and demand `+OK`.
    pub async fn select(&mut self, db: u64) -> Result<(), RespError> {
        let reply = self.call(&Msg::from_args(&["SELECT", &db.to_string()])).await?;
        if !reply.is_ok() {
            return Err(RespError::UnexpectedReply(format!(
                "SELECT error: server responded with '{}'",
                reply
            )));
        }
        Ok(())
    }

    /// Flush buffered output and shut the stream down.
    pub async fn close(mut self) {
        let _ = self.writer.flush().await;
        let _ = self.writer.shutdown().await;
    }

    fn log_message(&self, inbound: bool, data: &[u8]) {
        let dir = if inbound { ">" } else { "<" };
        let text = String::from_utf8_lossy(data)
            .replace('\r', "\\r")
            .replace('\n', "\\n");
        info!("{} {} {}", self.peer, dir, text);
    }
}
