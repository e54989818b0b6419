//! Line-oriented client connection.

use crate::error::ClientError;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected client.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connects to `addr` and, when a token is given, presents it as the
    /// credential line.
    pub async fn connect(addr: &str, token: Option<&str>) -> Result<Self, ClientError> {
        Self::connect_with_timeout(addr, token, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connects with an explicit connect timeout.
    pub async fn connect_with_timeout(
        addr: &str,
        token: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        if let Some(token) = token {
            client.send_line(token).await?;
        }

        Ok(client)
    }

    /// Sends one line, appending the terminator.
    pub async fn send_line(&mut self, line: &str) -> Result<(), ClientError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads one line, stripping the terminator. Returns `None` on a clean
    /// EOF.
    pub async fn read_line(&mut self) -> Result<Option<String>, ClientError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Shuts down the write side.
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
