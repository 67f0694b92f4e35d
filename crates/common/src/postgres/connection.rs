use crate::domain::{RepositoryError, RepositoryResult};
use crate::postgres::PostgresConfig;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info, warn};

enum ConnectionState {
    Disconnected,
    Connected(Client),
}

/// Single PostgreSQL connection with an explicit lifecycle.
///
/// The connection is either `Disconnected` or `Connected`. Writers call
/// `ensure_connected` before every use; it makes exactly one reconnect
/// attempt when the connection is missing or was closed by the server.
pub struct PostgresConnection {
    config: PostgresConfig,
    state: ConnectionState,
}

impl PostgresConnection {
    /// Creates a connection object in the `Disconnected` state
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        match &self.state {
            ConnectionState::Connected(client) => !client.is_closed(),
            ConnectionState::Disconnected => false,
        }
    }

    /// Drop the current session; the next `ensure_connected` reconnects
    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Open a new connection, replacing any previous one
    pub async fn connect(&mut self) -> Result<()> {
        self.state = ConnectionState::Disconnected;

        let (client, connection) = self
            .config
            .to_tokio_config()
            .connect(NoTls)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to PostgreSQL at {}:{}",
                    self.config.host, self.config.port
                )
            })?;

        // The connection future drives the socket; it resolves when the
        // server closes the session or the client is dropped.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgreSQL connection closed with error");
            }
        });

        self.state = ConnectionState::Connected(client);
        info!(
            host = %self.config.host,
            port = self.config.port,
            database = %self.config.database,
            "connected to PostgreSQL"
        );
        Ok(())
    }

    /// Connect at startup, retrying a bounded number of times.
    ///
    /// Returns the last error once `attempts` are exhausted; callers treat
    /// that as fatal.
    pub async fn connect_with_retry(&mut self, attempts: u32, delay: Duration) -> Result<()> {
        let attempts = attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "waiting for PostgreSQL"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempts, error = %e, "could not connect to PostgreSQL");
                    return Err(e);
                }
            }
        }
    }

    /// Return a live client, reconnecting once if needed.
    pub async fn ensure_connected(&mut self) -> RepositoryResult<&mut Client> {
        if !self.is_connected() {
            warn!("database connection lost, reconnecting");
            if let Err(e) = self.connect().await {
                error!(error = %e, "failed to reconnect to database");
                return Err(RepositoryError::NotConnected(format!("{:#}", e)));
            }
        }

        match &mut self.state {
            ConnectionState::Connected(client) => Ok(client),
            ConnectionState::Disconnected => Err(RepositoryError::NotConnected(
                "connection unavailable after reconnect".to_string(),
            )),
        }
    }
}
