//! vestibule - connection-admission shell for stream servers.
//!
//! Accepts TCP (optionally TLS) connections, gates them behind token
//! authentication when configured, and greets admitted clients.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vestibule_server::{
    no_authentication, tls, Authenticator, AuthenticatorProvider, Config, Connection, Server,
    ServerConfig, ServerEvent, TokenAuthenticator,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if VESTIBULE_CONFIG is set, then env
    // overrides)
    let mut config = match Config::load() {
        Ok(config) => {
            if let Ok(path) = std::env::var("VESTIBULE_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            config
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("VESTIBULE_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    // Load auth secrets from external file if configured
    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting vestibule");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);

    let provider: AuthenticatorProvider = if config.auth.required {
        if config.auth.token_hashes.is_empty() {
            tracing::error!("auth.required=true but no tokens configured!");
            return Err("Authentication required but no tokens configured".into());
        }
        tracing::info!(
            "  Authentication: enabled ({} token(s))",
            config.auth.token_hashes.len()
        );
        let authenticator: Arc<dyn Authenticator> =
            Arc::new(TokenAuthenticator::new(config.auth.token_hashes.clone()));
        Arc::new(move |_| Some(authenticator.clone()))
    } else {
        tracing::info!("  Authentication: disabled");
        no_authentication()
    };

    // Validate and build TLS config
    if let Err(e) = config.tls.validate() {
        tracing::error!("TLS configuration error: {}", e);
        return Err(e.into());
    }

    let mut server_config = ServerConfig::new(config.network.bind_addr);
    server_config.max_connections = config.network.max_connections;
    if config.tls.enabled {
        let acceptor = tls::build_acceptor(&config.tls)?;
        server_config = server_config.with_tls(acceptor);
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
    } else {
        tracing::info!("  TLS: disabled");
    }

    let server = Arc::new(Server::with_authenticator(server_config, greet, provider));

    // Surface gate-level warnings to the log; transport errors arrive on
    // the same channel.
    let mut events = server.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServerEvent::Warn { sid, error } => {
                    tracing::warn!("connection {} rejected: {}", sid, error);
                }
                ServerEvent::Error(error) => {
                    tracing::error!("listener error: {}", error);
                }
                ServerEvent::Listening(_) | ServerEvent::Closed => {}
            }
        }
    });

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.close();
    });

    // Run server (blocks until close)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Application connection logic: greet every admitted connection.
fn greet(conn: Arc<dyn Connection>) {
    tracing::info!("admitted {} from {}", conn.sid(), conn.peer_addr());
    conn.send(b"welcome\n");
}
