//! Connection wrapping.
//!
//! A [`ConnectionFactory`] turns a raw accepted stream into a
//! [`Connection`] handle plus a stream of lifecycle [`Signal`]s. The shell
//! never inspects payload bytes; it reacts only to the three signals.
//!
//! Signal contract, reproduced exactly by every factory implementation:
//! - `Auth` fires at most once, when the peer completes authentication.
//! - `Error` carries the fault; before release it discards the connection.
//! - `Close` fires exactly once per connection, last, even when the
//!   connection is forcibly destroyed.

use crate::auth::Authenticator;
use crate::error::ServerError;
use crate::stream::ServerStream;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Longest accepted credential line, terminator included.
const MAX_CREDENTIAL_BYTES: usize = 8 * 1024;

/// Lifecycle signal emitted by a connection wrapper.
#[derive(Debug)]
pub enum Signal {
    /// The peer completed authentication.
    Auth,
    /// The connection faulted.
    Error(ServerError),
    /// The connection is gone.
    Close,
}

/// Receiving end of a wrapper's signal channel.
pub type SignalReceiver = mpsc::UnboundedReceiver<Signal>;

/// Application-facing handle for one accepted connection.
pub trait Connection: Send + Sync {
    /// Unique session identifier, stable for the connection's lifetime.
    fn sid(&self) -> &str;

    /// Remote peer address.
    fn peer_addr(&self) -> SocketAddr;

    /// True from wrap time until the close signal fires.
    fn is_connected(&self) -> bool;

    /// Forcibly tears the connection down. Idempotent and safe to call on
    /// an already-closing connection.
    fn destroy(&self);

    /// Queues bytes for delivery to the peer. Best effort: data sent to a
    /// closing connection is dropped.
    fn send(&self, data: &[u8]);
}

/// Produces connection wrappers from raw accepted streams.
///
/// Keeps the admission gate decoupled from the concrete transport type.
pub trait ConnectionFactory: Send + Sync {
    fn wrap(
        &self,
        stream: ServerStream,
        peer_addr: SocketAddr,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> (Arc<dyn Connection>, SignalReceiver);
}

/// Control messages from a handle to its I/O task.
enum Control {
    Send(Vec<u8>),
    Destroy,
}

/// Handle for a connection driven by a spawned I/O task.
pub struct TcpConnection {
    sid: String,
    peer_addr: SocketAddr,
    connected: Arc<AtomicBool>,
    control: mpsc::UnboundedSender<Control>,
}

impl Connection for TcpConnection {
    fn sid(&self) -> &str {
        &self.sid
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn destroy(&self) {
        // A send error means the task already exited and close has fired.
        let _ = self.control.send(Control::Destroy);
    }

    fn send(&self, data: &[u8]) {
        let _ = self.control.send(Control::Send(data.to_vec()));
    }
}

/// Default factory: wraps plain TCP or TLS streams and, when an
/// authenticator is present, reads one credential line before signalling
/// auth.
#[derive(Debug, Default)]
pub struct TcpConnectionFactory;

impl ConnectionFactory for TcpConnectionFactory {
    fn wrap(
        &self,
        stream: ServerStream,
        peer_addr: SocketAddr,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> (Arc<dyn Connection>, SignalReceiver) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let handle = Arc::new(TcpConnection {
            sid: Uuid::new_v4().to_string(),
            peer_addr,
            connected: connected.clone(),
            control: control_tx,
        });

        tokio::spawn(connection_task(
            stream,
            peer_addr,
            authenticator,
            signal_tx,
            control_rx,
            connected,
        ));

        (handle, signal_rx)
    }
}

/// Outcome of examining buffered bytes for a credential line.
enum CredentialCheck {
    /// No full line yet.
    Incomplete,
    /// Credential accepted by the authenticator.
    Accepted,
    /// Credential rejected or malformed.
    Rejected(ServerError),
}

fn check_credential(buf: &mut BytesMut, authenticator: &dyn Authenticator) -> CredentialCheck {
    let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_CREDENTIAL_BYTES {
            return CredentialCheck::Rejected(ServerError::AuthFailed(
                "credential line too long".into(),
            ));
        }
        return CredentialCheck::Incomplete;
    };

    let line = buf.split_to(pos + 1);
    match std::str::from_utf8(&line[..pos]) {
        Ok(credential) => match authenticator.verify(credential.trim_end_matches('\r')) {
            Ok(()) => CredentialCheck::Accepted,
            Err(e) => CredentialCheck::Rejected(e),
        },
        Err(_) => CredentialCheck::Rejected(ServerError::AuthFailed(
            "credential is not valid UTF-8".into(),
        )),
    }
}

async fn connection_task(
    mut stream: ServerStream,
    peer_addr: SocketAddr,
    authenticator: Option<Arc<dyn Authenticator>>,
    signals: mpsc::UnboundedSender<Signal>,
    mut control: mpsc::UnboundedReceiver<Control>,
    connected: Arc<AtomicBool>,
) {
    let mut buf = BytesMut::with_capacity(1024);
    let mut awaiting_credential = authenticator.is_some();

    loop {
        tokio::select! {
            biased;

            msg = control.recv() => match msg {
                Some(Control::Send(data)) => {
                    if let Err(e) = stream.write_all(&data).await {
                        tracing::debug!("[{}] write error: {}", peer_addr, e);
                        let _ = signals.send(Signal::Error(ServerError::Io(e)));
                        break;
                    }
                }
                // A dropped handle is equivalent to destroy.
                Some(Control::Destroy) | None => {
                    tracing::debug!("[{}] connection destroyed", peer_addr);
                    break;
                }
            },

            result = stream.read_buf(&mut buf) => match result {
                Ok(0) => {
                    tracing::debug!("[{}] connection closed by peer", peer_addr);
                    break;
                }
                Ok(_) => {
                    if let Some(ref authenticator) = authenticator {
                        if awaiting_credential {
                            match check_credential(&mut buf, authenticator.as_ref()) {
                                CredentialCheck::Incomplete => {}
                                CredentialCheck::Accepted => {
                                    awaiting_credential = false;
                                    // Pipelined bytes after the credential are
                                    // payload, which this shell never inspects.
                                    buf.clear();
                                    let _ = signals.send(Signal::Auth);
                                }
                                CredentialCheck::Rejected(e) => {
                                    let _ = signals.send(Signal::Error(e));
                                    break;
                                }
                            }
                            continue;
                        }
                    }
                    buf.clear();
                }
                Err(e) => {
                    tracing::debug!("[{}] read error: {}", peer_addr, e);
                    let _ = signals.send(Signal::Error(ServerError::Io(e)));
                    break;
                }
            },
        }
    }

    connected.store(false, Ordering::Release);
    let _ = signals.send(Signal::Close);
}
