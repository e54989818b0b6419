//! # vestibule-client
//!
//! Minimal async client for admission-gated servers.
//!
//! Connects over TCP, optionally presents a credential line, then exchanges
//! newline-delimited text with the server.

pub mod client;
pub mod error;

pub use client::Client;
pub use error::ClientError;
