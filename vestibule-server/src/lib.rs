//! # vestibule-server
//!
//! Connection-admission shell for stream servers.
//!
//! This crate provides:
//! - An accept loop bridging a TCP (optionally TLS) listener to application logic
//! - Per-connection admission gating behind pluggable authenticators
//! - Live-connection tracking for bulk teardown
//! - Lifecycle event fan-out (listening, error, close, warn)

pub mod auth;
pub mod config;
pub mod conn;
pub mod error;
pub mod events;
pub mod gate;
pub mod registry;
pub mod server;
pub mod stream;
pub mod tls;

pub use auth::{no_authentication, Authenticator, AuthenticatorProvider, TokenAuthenticator};
pub use config::{AuthConfig, Config, NetworkConfig, TlsConfig};
pub use conn::{Connection, ConnectionFactory, Signal, SignalReceiver, TcpConnectionFactory};
pub use error::ServerError;
pub use events::{EventHub, ServerEvent};
pub use gate::{AdmissionGate, GateState};
pub use registry::ConnectionRegistry;
pub use server::{ConnectionListener, Server, ServerConfig, ServerStats};
pub use stream::ServerStream;
