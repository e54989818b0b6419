//! Accepted-stream abstraction over plain TCP and TLS.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

pin_project! {
    /// A raw accepted stream, before any connection wrapping.
    #[project = ServerStreamProj]
    pub enum ServerStream {
        Tcp { #[pin] inner: TcpStream },
        Tls { #[pin] inner: TlsStream<TcpStream> },
    }
}

impl ServerStream {
    /// Returns whether the stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, ServerStream::Tls { .. })
    }
}

impl From<TcpStream> for ServerStream {
    fn from(inner: TcpStream) -> Self {
        ServerStream::Tcp { inner }
    }
}

impl From<TlsStream<TcpStream>> for ServerStream {
    fn from(inner: TlsStream<TcpStream>) -> Self {
        ServerStream::Tls { inner }
    }
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ServerStreamProj::Tcp { inner } => inner.poll_read(cx, buf),
            ServerStreamProj::Tls { inner } => inner.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ServerStreamProj::Tcp { inner } => inner.poll_write(cx, buf),
            ServerStreamProj::Tls { inner } => inner.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ServerStreamProj::Tcp { inner } => inner.poll_flush(cx),
            ServerStreamProj::Tls { inner } => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ServerStreamProj::Tcp { inner } => inner.poll_shutdown(cx),
            ServerStreamProj::Tls { inner } => inner.poll_shutdown(cx),
        }
    }
}
