//! The connection-admission server shell.
//!
//! Bridges a TCP (optionally TLS) listener to application connection logic:
//! every accepted stream is wrapped, registered, and either handed straight
//! to the application or held behind the admission gate until its
//! authenticator resolves. Listener lifecycle is re-published as
//! [`ServerEvent`]s.

use crate::auth::{no_authentication, AuthenticatorProvider};
use crate::conn::{Connection, ConnectionFactory, Signal, SignalReceiver, TcpConnectionFactory};
use crate::error::ServerError;
use crate::events::{EventHub, ServerEvent};
use crate::gate::AdmissionGate;
use crate::registry::ConnectionRegistry;
use crate::stream::ServerStream;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7601".parse().unwrap(),
            max_connections: 1024,
            tls_acceptor: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Returns whether TLS is enabled.
    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Connections accepted by the transport.
    pub connections_total: AtomicU64,
    /// Transport-level connections currently alive. May transiently differ
    /// from the registry size while a connection is being wrapped or torn
    /// down.
    pub connections_active: AtomicU64,
    /// Connections released to application logic.
    pub admitted_total: AtomicU64,
    /// Connections discarded before authentication completed.
    pub discarded_total: AtomicU64,
    /// Transport-level faults.
    pub errors_total: AtomicU64,
}

/// Application callback invoked once per admitted connection.
pub trait ConnectionListener: Send + Sync {
    fn on_connection(&self, conn: Arc<dyn Connection>);
}

impl<F> ConnectionListener for F
where
    F: Fn(Arc<dyn Connection>) + Send + Sync,
{
    fn on_connection(&self, conn: Arc<dyn Connection>) {
        self(conn)
    }
}

/// State shared between the accept loop and per-connection tasks.
struct Shared {
    app: Arc<dyn ConnectionListener>,
    factory: Arc<dyn ConnectionFactory>,
    provider: AuthenticatorProvider,
    registry: ConnectionRegistry,
    events: EventHub,
    stats: ServerStats,
    /// Set by [`Server::close`] before the registry drain. Connections that
    /// arrive afterwards (a TLS handshake can finish after the drain) are
    /// destroyed on arrival.
    closing: AtomicBool,
}

/// The connection-admission server.
pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Creates a server that admits every connection without
    /// authentication.
    pub fn new(config: ServerConfig, app: impl ConnectionListener + 'static) -> Self {
        Self::with_authenticator(config, app, no_authentication())
    }

    /// Creates a server whose connections are gated behind the
    /// authenticator resolved per connection by `provider`.
    pub fn with_authenticator(
        config: ServerConfig,
        app: impl ConnectionListener + 'static,
        provider: AuthenticatorProvider,
    ) -> Self {
        Self::with_factory(config, app, provider, Arc::new(TcpConnectionFactory))
    }

    /// Creates a server using a custom connection factory.
    pub fn with_factory(
        config: ServerConfig,
        app: impl ConnectionListener + 'static,
        provider: AuthenticatorProvider,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            shared: Arc::new(Shared {
                app: Arc::new(app),
                factory,
                provider,
                registry: ConnectionRegistry::new(),
                events: EventHub::default(),
                stats: ServerStats::default(),
                closing: AtomicBool::new(false),
            }),
            shutdown,
            local_addr: Mutex::new(None),
        }
    }

    /// Registers a lifecycle event subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Returns the bound local address, or `None` while not listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Returns the live-connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    /// Returns the transport-level count of live connections.
    ///
    /// Read asynchronously so in-flight accept bookkeeping can settle
    /// first; the value may still transiently differ from the registry
    /// size.
    pub async fn connection_count(&self) -> u64 {
        tokio::task::yield_now().await;
        self.shared.stats.connections_active.load(Ordering::Relaxed)
    }

    /// Destroys every registered connection, then stops the listener.
    ///
    /// Unconditional and permanent: in-flight application work gets no
    /// grace period, and a closed server refuses any connection that is
    /// still mid-handshake. The registry is empty by the time the accept
    /// loop stops.
    pub fn close(&self) {
        tracing::info!(
            "closing server, destroying {} connection(s)",
            self.shared.registry.len()
        );
        self.shared.closing.store(true, Ordering::Release);
        self.shared.registry.drain_destroy();
        let _ = self.shutdown.send(());
    }

    /// Binds the listener and accepts connections until [`Server::close`]
    /// is called.
    ///
    /// Transport-fatal errors are published as [`ServerEvent::Error`]; a
    /// bind failure is additionally returned to the caller.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = match TcpListener::bind(self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("bind {} failed: {}", self.config.bind_addr, e);
                // The event and the return value each need an owned error.
                let copy = std::io::Error::new(e.kind(), e.to_string());
                self.shared
                    .events
                    .publish(ServerEvent::Error(Arc::new(ServerError::Io(copy))));
                return Err(ServerError::Io(e));
            }
        };
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(addr);

        let tls_mode = if self.config.tls_enabled() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!("server listening on {} ({})", addr, tls_mode);
        self.shared.events.publish(ServerEvent::Listening(addr));

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((tcp_stream, peer_addr)) => {
                        if self.shared.stats.connections_active.load(Ordering::Relaxed)
                            >= self.config.max_connections as u64
                        {
                            let e = ServerError::ConnectionLimit;
                            tracing::warn!("dropping {}: {}", peer_addr, e);
                            self.shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                            self.shared.events.publish(ServerEvent::Error(Arc::new(e)));
                            continue;
                        }

                        self.shared.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                        self.shared.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                        match self.config.tls_acceptor {
                            None => self.shared.admit(ServerStream::from(tcp_stream), peer_addr),
                            Some(ref acceptor) => {
                                // The handshake completes off the accept loop;
                                // wrapping happens only on an established stream.
                                let acceptor = acceptor.clone();
                                let shared = self.shared.clone();
                                tokio::spawn(async move {
                                    match acceptor.accept(tcp_stream).await {
                                        Ok(tls_stream) => {
                                            shared.admit(ServerStream::from(tls_stream), peer_addr);
                                        }
                                        Err(e) => {
                                            tracing::warn!(
                                                "[{}] TLS handshake failed: {}",
                                                peer_addr,
                                                e
                                            );
                                            shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                            shared
                                                .stats
                                                .connections_active
                                                .fetch_sub(1, Ordering::Relaxed);
                                        }
                                    }
                                });
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("accept error: {}", e);
                        self.shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        self.shared
                            .events
                            .publish(ServerEvent::Error(Arc::new(ServerError::Io(e))));
                    }
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        *self.local_addr.lock().unwrap() = None;
        self.shared.events.publish(ServerEvent::Closed);
        tracing::info!("server stopped");
        Ok(())
    }
}

impl Shared {
    /// Wraps an established stream, registers it, and routes it through the
    /// admission gate.
    fn admit(self: &Arc<Self>, stream: ServerStream, peer_addr: SocketAddr) {
        let authenticator = (self.provider)(peer_addr);
        let gated = authenticator.is_some();
        let transport = if stream.is_tls() { "TLS" } else { "plain" };

        let (conn, signals) = self.factory.wrap(stream, peer_addr, authenticator);
        // Registration precedes any authentication decision.
        self.registry.insert(conn.clone());

        // Re-check after the insert: close() sets the flag before draining,
        // so a connection landing here from an in-flight handshake either
        // gets drained or is destroyed right now.
        if self.closing.load(Ordering::Acquire) {
            tracing::warn!("[{}] refused: {}", conn.sid(), ServerError::ShuttingDown);
            self.registry.remove(conn.sid());
            conn.destroy();
            self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        tracing::info!(
            "client connected: {} (sid {}, {})",
            peer_addr,
            conn.sid(),
            transport
        );

        let gate = if gated {
            AdmissionGate::pending()
        } else {
            // No authenticator: release inside the accept path, before the
            // signal loop runs.
            self.stats.admitted_total.fetch_add(1, Ordering::Relaxed);
            self.app.on_connection(conn.clone());
            AdmissionGate::open()
        };

        tokio::spawn(self.clone().drive(conn, signals, gate));
    }

    /// Consumes one connection's lifecycle signals until it closes.
    ///
    /// Signals for one connection arrive sequentially, so the gate sees a
    /// single deciding event even when auth and error race.
    async fn drive(
        self: Arc<Self>,
        conn: Arc<dyn Connection>,
        mut signals: SignalReceiver,
        mut gate: AdmissionGate,
    ) {
        while let Some(signal) = signals.recv().await {
            match signal {
                Signal::Auth => {
                    if gate.on_auth() {
                        tracing::debug!("[{}] authenticated", conn.sid());
                        self.stats.admitted_total.fetch_add(1, Ordering::Relaxed);
                        self.app.on_connection(conn.clone());
                    }
                }
                Signal::Error(e) => {
                    if gate.on_error() {
                        // Fault on a pending connection: the peer never
                        // completed the handshake, so destroy quietly and
                        // warn instead of raising a server error. Faults the
                        // peer did not cause still log at error severity.
                        conn.destroy();
                        if e.is_peer_fault() {
                            tracing::warn!("[{}] discarded before auth: {}", conn.sid(), e);
                        } else {
                            tracing::error!("[{}] discarded before auth: {}", conn.sid(), e);
                        }
                        self.stats.discarded_total.fetch_add(1, Ordering::Relaxed);
                        self.events.publish(ServerEvent::Warn {
                            sid: conn.sid().to_string(),
                            error: Arc::new(e),
                        });
                    } else {
                        tracing::debug!("[{}] post-release error: {}", conn.sid(), e);
                    }
                }
                Signal::Close => break,
            }
        }

        self.registry.remove(conn.sid());
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        tracing::info!("client disconnected: {} (sid {})", conn.peer_addr(), conn.sid());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Authenticator, TokenAuthenticator};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use vestibule_client::Client;

    const WAIT: Duration = Duration::from_secs(2);

    fn token_provider(token: &str) -> AuthenticatorProvider {
        let auth: Arc<dyn Authenticator> =
            Arc::new(TokenAuthenticator::new(vec![TokenAuthenticator::hash_token(token)]));
        Arc::new(move |_| Some(auth.clone()))
    }

    struct Running {
        server: Arc<Server>,
        addr: SocketAddr,
        admitted: mpsc::UnboundedReceiver<String>,
        events: broadcast::Receiver<ServerEvent>,
        handle: tokio::task::JoinHandle<Result<(), ServerError>>,
    }

    async fn start(provider: Option<AuthenticatorProvider>) -> Running {
        let (tx, admitted) = mpsc::unbounded_channel();
        let callback = move |conn: Arc<dyn Connection>| {
            let _ = tx.send(conn.sid().to_string());
        };
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let server = Arc::new(match provider {
            Some(provider) => Server::with_authenticator(config, callback, provider),
            None => Server::new(config, callback),
        });

        let mut events = server.subscribe();
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        let addr = match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            ServerEvent::Listening(addr) => addr,
            other => panic!("expected listening, got {:?}", other),
        };

        Running {
            server,
            addr,
            admitted,
            events,
            handle,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }

    #[tokio::test]
    async fn test_unauthenticated_connection_admitted_immediately() {
        let mut running = start(None).await;

        let _client = TcpStream::connect(running.addr).await.unwrap();
        let sid = timeout(WAIT, running.admitted.recv()).await.unwrap().unwrap();
        assert!(!sid.is_empty());
        assert_eq!(running.server.registry().len(), 1);

        // The admitted connection must never produce a warn.
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(event) = running.events.try_recv() {
            assert!(!matches!(event, ServerEvent::Warn { .. }));
        }
    }

    #[tokio::test]
    async fn test_authenticated_client_released_exactly_once() {
        let mut running = start(Some(token_provider("sesame"))).await;

        let _client = Client::connect(&running.addr.to_string(), Some("sesame"))
            .await
            .unwrap();
        let sid = timeout(WAIT, running.admitted.recv()).await.unwrap().unwrap();
        assert!(running.server.registry().get(&sid).is_some());

        // One connection, one release.
        assert!(running.admitted.try_recv().is_err());
        assert_eq!(
            running.server.stats().admitted_total.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_probe_with_bad_credential_discarded_with_warn() {
        let mut running = start(Some(token_provider("sesame"))).await;

        let mut client = TcpStream::connect(running.addr).await.unwrap();
        client.write_all(b"not-the-token\n").await.unwrap();

        let (sid, error) = loop {
            match timeout(WAIT, running.events.recv()).await.unwrap().unwrap() {
                ServerEvent::Warn { sid, error } => break (sid, error),
                _ => continue,
            }
        };
        assert!(!sid.is_empty());
        assert!(matches!(*error, ServerError::AuthFailed(_)));

        // Application logic never saw the probe, and the wrapper was
        // destroyed: the peer observes EOF.
        assert!(running.admitted.try_recv().is_err());
        let mut buf = [0u8; 8];
        let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);

        let server = running.server.clone();
        wait_until(move || server.registry().is_empty()).await;
        assert_eq!(
            running.server.stats().discarded_total.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_disconnect_before_auth_closes_silently() {
        let mut running = start(Some(token_provider("sesame"))).await;

        // A bare probe: connect and hang up without sending anything.
        drop(TcpStream::connect(running.addr).await.unwrap());

        let server = running.server.clone();
        wait_until(move || {
            server.stats().connections_total.load(Ordering::Relaxed) >= 1
                && server.registry().is_empty()
        })
        .await;

        assert!(running.admitted.try_recv().is_err());
        while let Ok(event) = running.events.try_recv() {
            assert!(!matches!(event, ServerEvent::Warn { .. }));
        }
    }

    #[tokio::test]
    async fn test_close_destroys_every_connection() {
        let mut running = start(None).await;

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(running.addr).await.unwrap());
        }
        for _ in 0..3 {
            timeout(WAIT, running.admitted.recv()).await.unwrap().unwrap();
        }
        assert_eq!(running.server.registry().len(), 3);

        running.server.close();

        // The registry is drained synchronously, before the listener stops.
        assert!(running.server.registry().is_empty());
        assert!(timeout(WAIT, running.handle).await.unwrap().unwrap().is_ok());
        assert_eq!(running.server.local_addr(), None);

        loop {
            match timeout(WAIT, running.events.recv()).await.unwrap().unwrap() {
                ServerEvent::Closed => break,
                _ => continue,
            }
        }

        for mut client in clients {
            let mut buf = [0u8; 8];
            let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn test_connection_count_tracks_transport() {
        let mut running = start(None).await;

        let client_a = TcpStream::connect(running.addr).await.unwrap();
        let client_b = TcpStream::connect(running.addr).await.unwrap();
        for _ in 0..2 {
            timeout(WAIT, running.admitted.recv()).await.unwrap().unwrap();
        }

        assert_eq!(running.server.connection_count().await, 2);
        assert_eq!(running.server.registry().len(), 2);

        drop(client_a);
        drop(client_b);
        let server = running.server.clone();
        wait_until(move || server.registry().is_empty()).await;
    }

    #[tokio::test]
    async fn test_local_addr_set_while_listening() {
        let running = start(None).await;
        assert_eq!(running.server.local_addr(), Some(running.addr));
    }

    #[tokio::test]
    async fn test_bind_failure_publishes_error() {
        let occupier = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupier.local_addr().unwrap();

        let server = Server::new(ServerConfig::new(addr), |_conn: Arc<dyn Connection>| {});
        let mut events = server.subscribe();

        assert!(server.run().await.is_err());
        assert!(matches!(events.try_recv().unwrap(), ServerEvent::Error(_)));
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn test_late_auth_after_close_is_not_released() {
        let mut running = start(Some(token_provider("sesame"))).await;

        let mut client = TcpStream::connect(running.addr).await.unwrap();
        let server = running.server.clone();
        wait_until(move || server.registry().len() == 1).await;

        running.server.close();

        // Credential sent after teardown: the write may succeed against a
        // half-closed socket, but the connection must never be admitted.
        let _ = client.write_all(b"sesame\n").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(running.admitted.try_recv().is_err());
        assert!(running.server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_connection_over_limit_dropped_with_error_event() {
        let (tx, mut admitted) = mpsc::unbounded_channel();
        let callback = move |conn: Arc<dyn Connection>| {
            let _ = tx.send(conn.sid().to_string());
        };
        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        config.max_connections = 1;
        let server = Arc::new(Server::new(config, callback));

        let mut events = server.subscribe();
        let _handle = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        let addr = match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            ServerEvent::Listening(addr) => addr,
            other => panic!("expected listening, got {:?}", other),
        };

        let _first = TcpStream::connect(addr).await.unwrap();
        timeout(WAIT, admitted.recv()).await.unwrap().unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        let error = loop {
            match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
                ServerEvent::Error(e) => break e,
                _ => continue,
            }
        };
        assert!(matches!(*error, ServerError::ConnectionLimit));
        assert_eq!(server.stats().errors_total.load(Ordering::Relaxed), 1);

        // The excess stream is dropped without wrapping: the peer sees the
        // connection close, and application logic never runs.
        let mut buf = [0u8; 8];
        assert!(matches!(
            timeout(WAIT, second.read(&mut buf)).await.unwrap(),
            Ok(0) | Err(_)
        ));
        assert!(admitted.try_recv().is_err());
        assert_eq!(server.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_arriving_during_close_is_destroyed() {
        let (tx, mut admitted) = mpsc::unbounded_channel();
        let callback = move |conn: Arc<dyn Connection>| {
            let _ = tx.send(conn.sid().to_string());
        };
        let shared = Arc::new(Shared {
            app: Arc::new(callback),
            factory: Arc::new(TcpConnectionFactory),
            provider: no_authentication(),
            registry: ConnectionRegistry::new(),
            events: EventHub::default(),
            stats: ServerStats::default(),
            closing: AtomicBool::new(true),
        });

        // A stream whose TLS handshake finished only after close() drained
        // the registry: it must not outlive the drain.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        shared.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        shared.admit(ServerStream::from(accepted), peer);

        assert!(shared.registry.is_empty());
        assert_eq!(shared.stats.connections_active.load(Ordering::Relaxed), 0);
        assert!(admitted.try_recv().is_err());

        let mut buf = [0u8; 8];
        let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }
}
