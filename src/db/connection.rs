use deadpool_postgres::{
    Config, ManagerConfig, Object, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime, Status,
};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

use super::StructuredError;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub ssl_mode: SslMode,
    /// Skip certificate verification in `Prefer` / `Require` modes.
    pub accept_invalid_certs: bool,
    /// PEM file with one or more CA certificates. System roots otherwise.
    pub ca_cert_path: Option<String>,
    /// Upper bound of pooled connections.
    pub max_connections: usize,
    pub connect_timeout_secs: u64,
    /// Server-side `statement_timeout` for every session, 0 disables it.
    pub statement_timeout_ms: u64,
}

/// SSL/TLS connection modes, as in the libpq `sslmode` parameter.
///
/// `VerifyCa` and `VerifyFull` always verify certificates, ignoring
/// `accept_invalid_certs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    fn as_libpq(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }

    /// The pool only knows disable / prefer / require; verification is the
    /// connector's job.
    fn to_pool(self) -> deadpool_postgres::SslMode {
        match self {
            SslMode::Disable => deadpool_postgres::SslMode::Disable,
            SslMode::Prefer => deadpool_postgres::SslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                deadpool_postgres::SslMode::Require
            }
        }
    }

    fn strict(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

impl ConnectionConfig {
    pub fn connection_string(&self) -> String {
        let mut conn = format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout={}",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            self.ssl_mode.as_libpq(),
            self.connect_timeout_secs
        );
        if let Some(options) = self.session_options() {
            conn.push_str(&format!(" options={}", quote_conn_value(&options)));
        }
        conn
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }

    fn session_options(&self) -> Option<String> {
        (self.statement_timeout_ms > 0)
            .then(|| format!("-c statement_timeout={}", self.statement_timeout_ms))
    }

    fn pool_config(&self) -> Config {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.database.clone());
        cfg.user = Some(self.username.clone());
        if !self.password.is_empty() {
            cfg.password = Some(self.password.clone());
        }
        cfg.ssl_mode = Some(self.ssl_mode.to_pool());
        cfg.connect_timeout = Some(Duration::from_secs(self.connect_timeout_secs));
        cfg.options = self.session_options();
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(self.max_connections));
        cfg
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            max_connections: 10,
            connect_timeout_secs: 10,
            statement_timeout_ms: 0,
        }
    }
}

/// Owner of the connection pool used for batched writes and filter queries.
///
/// The pool lives until [`close`](Self::close) is called; afterwards every
/// checkout fails with [`StoreError::Closed`].
pub struct ConnectionManager {
    config: ConnectionConfig,
    pool: Pool,
}

impl ConnectionManager {
    /// Build the pool and check out one connection to verify the server is
    /// reachable with these credentials.
    pub async fn open(config: ConnectionConfig) -> StoreResult<Self> {
        let pool = create_pool(&config)?;
        let manager = Self { config, pool };

        let client = manager.get().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| StoreError::execution(&e, "SELECT 1"))?;
        drop(client);

        info!(
            server = %manager.config.display_string(),
            max_connections = manager.config.max_connections,
            "connection pool opened"
        );
        Ok(manager)
    }

    pub async fn get(&self) -> StoreResult<Object> {
        match self.pool.get().await {
            Ok(client) => Ok(client),
            Err(PoolError::Closed) => Err(StoreError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    pub fn status(&self) -> Status {
        self.pool.status()
    }

    pub fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close();
            info!(server = %self.config.display_string(), "connection pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

fn create_pool(config: &ConnectionConfig) -> StoreResult<Pool> {
    let cfg = config.pool_config();
    let pool = match config.ssl_mode {
        SslMode::Disable => cfg.create_pool(Some(Runtime::Tokio1), NoTls)?,
        mode => {
            let tls = build_tls_connector(config, mode.strict())?;
            cfg.create_pool(Some(Runtime::Tokio1), tls)?
        }
    };
    Ok(pool)
}

/// Open one dedicated session outside the pool. The connection task is
/// spawned on the current runtime.
pub async fn create_client(config: &ConnectionConfig) -> StoreResult<Client> {
    let conn_string = config.connection_string();
    let timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
    let timed_out = || {
        StoreError::Execution(StructuredError::from_string(format!(
            "connection to {} timed out after {}s",
            config.display_string(),
            timeout.as_secs()
        )))
    };

    let client = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, NoTls))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|e| StoreError::execution(&e, ""))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!(error = %e, "connection error");
                }
            });
            client
        }
        mode => {
            let tls = build_tls_connector(config, mode.strict())?;
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, tls))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|e| StoreError::execution(&e, ""))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!(error = %e, "connection error");
                }
            });
            client
        }
    };

    Ok(client)
}

fn build_tls_connector(config: &ConnectionConfig, strict_verify: bool) -> StoreResult<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let pem = std::fs::read_to_string(ca_path).map_err(|e| {
            StoreError::Tls(format!("failed to read CA certificate file {}: {}", ca_path, e))
        })?;
        let blocks = split_pem_certificates(&pem);
        if blocks.is_empty() {
            return Err(StoreError::Tls(format!("no certificates found in {}", ca_path)));
        }
        for block in blocks {
            let cert = native_tls::Certificate::from_pem(block.as_bytes())
                .map_err(|e| StoreError::Tls(format!("invalid certificate in {}: {}", ca_path, e)))?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder
        .build()
        .map_err(|e| StoreError::Tls(format!("failed to build TLS connector: {}", e)))?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into individual certificate blocks.
fn split_pem_certificates(pem: &str) -> Vec<String> {
    let mut certs = Vec::new();
    let mut current: Option<String> = None;

    for line in pem.lines() {
        let line = line.trim();
        if line == "-----BEGIN CERTIFICATE-----" {
            current = Some(format!("{}\n", line));
        } else if line == "-----END CERTIFICATE-----" {
            if let Some(mut cert) = current.take() {
                cert.push_str(line);
                cert.push('\n');
                certs.push(cert);
            }
        } else if let Some(cert) = current.as_mut() {
            cert.push_str(line);
            cert.push('\n');
        }
    }

    certs
}

/// Quote a value for a libpq key=value connection string.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string() {
        let config = ConnectionConfig {
            password: "it's".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.connection_string(),
            "host='localhost' port=5432 dbname='postgres' user='postgres' \
             password='it\\'s' sslmode=prefer connect_timeout=10"
        );
    }

    #[test]
    fn test_statement_timeout_option() {
        let config = ConnectionConfig {
            statement_timeout_ms: 5000,
            ..Default::default()
        };
        assert!(config
            .connection_string()
            .ends_with("options='-c statement_timeout=5000'"));
        let pool = config.pool_config();
        assert_eq!(pool.options.as_deref(), Some("-c statement_timeout=5000"));
    }

    #[test]
    fn test_pool_config() {
        let config = ConnectionConfig {
            ssl_mode: SslMode::VerifyFull,
            max_connections: 4,
            ..Default::default()
        };
        let cfg = config.pool_config();
        assert!(matches!(cfg.ssl_mode, Some(deadpool_postgres::SslMode::Require)));
        assert_eq!(cfg.pool.map(|p| p.max_size), Some(4));
        assert!(cfg.password.is_none());
        assert!(cfg.options.is_none());
    }

    #[test]
    fn test_password_not_serialized() {
        let config = ConnectionConfig {
            password: "secret".to_string(),
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("secret"));
        let back: ConnectionConfig = toml::from_str(&text).unwrap();
        assert!(back.password.is_empty());
        assert_eq!(back.host, "localhost");
    }

    #[test]
    fn test_split_pem_certificates() {
        let pem = "junk\n-----BEGIN CERTIFICATE-----\nAAAA\nBBBB\n-----END CERTIFICATE-----\n\
                   -----BEGIN CERTIFICATE-----\nCCCC\n-----END CERTIFICATE-----\n";
        let certs = split_pem_certificates(pem);
        assert_eq!(certs.len(), 2);
        assert_eq!(
            certs[0],
            "-----BEGIN CERTIFICATE-----\nAAAA\nBBBB\n-----END CERTIFICATE-----\n"
        );
        assert!(split_pem_certificates("no certs here").is_empty());
    }

    #[test]
    fn test_display_string() {
        assert_eq!(
            ConnectionConfig::default().display_string(),
            "postgres@localhost:5432/postgres"
        );
    }
}
