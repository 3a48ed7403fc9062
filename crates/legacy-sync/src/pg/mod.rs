//! PostgreSQL implementations of the store traits.
//!
//! Both the legacy source and the redesigned target are PostgreSQL
//! databases reached through `deadpool-postgres`. Rows cross the wire as
//! `jsonb`, which keeps the adapters independent of column types.

mod ident;
mod mapping;
mod source;
mod target;
mod tls;

pub use ident::{qualify, quote, split_location, validate_identifier};
pub use mapping::PgMappingStore;
pub use source::PgSource;
pub use target::PgTarget;
pub use tls::SslMode;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::Config as PgConfig;
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::error::{MigrateError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Open a pool for `config` and verify it with a round trip.
///
/// `role` names the connection in logs and errors ("source", "target").
pub async fn connect_pool(config: &DatabaseConfig, max_conns: usize, role: &str) -> Result<Pool> {
    let mut pg_config = PgConfig::new();
    pg_config.host(&config.host);
    pg_config.port(config.port);
    pg_config.dbname(&config.database);
    pg_config.user(&config.user);
    pg_config.password(&config.password);
    pg_config.application_name("legacy-sync");
    pg_config.keepalives(true);
    pg_config.keepalives_idle(Duration::from_secs(30));
    pg_config.connect_timeout(CONNECT_TIMEOUT);

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let context = format!("creating PostgreSQL {} pool", role);

    let pool = match tls::connector(SslMode::parse(&config.ssl_mode)?)? {
        None => {
            warn!("PostgreSQL {} TLS is disabled", role);
            let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
            Pool::builder(mgr)
                .max_size(max_conns)
                .build()
                .map_err(|e| MigrateError::pool(e.to_string(), context.as_str()))?
        }
        Some(tls) => {
            let mgr = Manager::from_config(pg_config, tls, mgr_config);
            Pool::builder(mgr)
                .max_size(max_conns)
                .build()
                .map_err(|e| MigrateError::pool(e.to_string(), context.as_str()))?
        }
    };

    let client = pool
        .get()
        .await
        .map_err(|e| MigrateError::pool(e.to_string(), format!("testing PostgreSQL {} connection", role)))?;
    client.simple_query("SELECT 1").await?;

    info!(
        "Connected to PostgreSQL {}: {}:{}/{} (pool size {})",
        role, config.host, config.port, config.database, max_conns
    );
    Ok(pool)
}
