//! PostgreSQL connection pool.

use crate::config::Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool};
use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::fs::File;
use std::io::BufReader;
use tokio_postgres::{Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{error, info};

pub type PgPool = Pool<PgConnectionManager>;

const SCHEMA_SQL: &str = include_str!("../migrations/0001_stacktach.sql");

pub async fn connect_pool(config: &Config) -> Result<PgPool> {
    let tls = TlsFiles {
        root_cert: config.pg_ssl_root_cert.as_deref(),
        client_cert: config.pg_ssl_cert.as_deref(),
        client_key: config.pg_ssl_key.as_deref(),
    };
    let manager = PgConnectionManager::new(config.database_url(), &tls)?;
    let pool = Pool::builder()
        .max_size(config.max_pool_size)
        .build(manager)
        .await
        .context("failed to build PostgreSQL connection pool")?;

    match pool.get().await {
        Ok(_) => info!("database connectivity check succeeded"),
        Err(err) => error!(error = ?err, "initial database connectivity check failed"),
    }

    Ok(pool)
}

/// Creates the tables if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|err| match err {
            bb8::RunError::User(err) => anyhow::anyhow!("failed to check out connection: {err}"),
            bb8::RunError::TimedOut => {
                anyhow::anyhow!("failed to check out connection: Timed out in bb8")
            }
        })?;
    conn.batch_execute(SCHEMA_SQL)
        .await
        .context("failed to apply stacktach schema")?;
    info!("stacktach schema applied");
    Ok(())
}

struct TlsFiles<'a> {
    root_cert: Option<&'a str>,
    client_cert: Option<&'a str>,
    client_key: Option<&'a str>,
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
    tls: PgTls,
}

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

impl PgConnectionManager {
    fn new(database_url: &str, tls: &TlsFiles<'_>) -> Result<Self> {
        let config = database_url
            .parse::<PgConfig>()
            .context("invalid database_url")?;
        let tls = match tls.root_cert {
            Some(root) => PgTls::Rustls(build_tls_connector(root, tls)?),
            None => PgTls::None,
        };
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = AsyncPgConnection;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let config = self.config.clone();
        match &self.tls {
            PgTls::None => {
                let (client, connection) = config.connect(NoTls).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection)
                    .await
                    .map_err(|err| anyhow::anyhow!(err))
            }
            PgTls::Rustls(connector) => {
                let (client, connection) = config.connect(connector.clone()).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection)
                    .await
                    .map_err(|err| anyhow::anyhow!(err))
            }
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}

fn build_tls_connector(root_cert: &str, files: &TlsFiles<'_>) -> Result<MakeRustlsConnect> {
    let mut reader = BufReader::new(
        File::open(root_cert).with_context(|| format!("failed to open root cert '{root_cert}'"))?,
    );
    let mut roots = RootCertStore::empty();
    for cert in certs(&mut reader) {
        let cert = cert.context("failed to parse root cert")?;
        roots
            .add(cert)
            .map_err(|_| anyhow::anyhow!("invalid certificate in {root_cert}"))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let client = match (files.client_cert, files.client_key) {
        (None, None) => builder.with_no_client_auth(),
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_client_certs(cert)?, load_client_key(key)?)
            .context("failed to build client TLS config")?,
        _ => anyhow::bail!("pg_ssl_cert and pg_ssl_key must both be set (or neither)"),
    };
    Ok(MakeRustlsConnect::new(client))
}

fn load_client_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open client cert '{path}'"))?,
    );
    let chain = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse client cert")?;
    if chain.is_empty() {
        anyhow::bail!("{path} contained no certificates");
    }
    Ok(chain)
}

fn load_client_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open client key '{path}'"))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .context("failed to parse client key")?
        .with_context(|| format!("{path} contained no private keys"))
}
