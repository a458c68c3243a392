use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

use crate::route::{Route, RouteResolver};
use crate::session::{Protocol, Session};

// -----------------------------------------------------------------------------
// ----- Singleton ---------------------------------------------------------------

static ROUTES: OnceLock<Arc<RwLock<RoutesConfig>>> = OnceLock::new();

// -----------------------------------------------------------------------------
// ----- RoutesConfig ------------------------------------------------------------

/// TOML route table (§6.3): per-database routes for Postgres, keyed by
/// database name with a `*` wildcard; a single Cassandra target; a single
/// Mongo target. Loaded once at startup, reloadable.
#[derive(Debug, Clone, Default)]
pub struct RoutesConfig {
    postgres_routes: Vec<PgRouteEntry>,
    cassandra: Option<CassandraRouteEntry>,
    mongo: Option<MongoRouteEntry>,
}

impl RoutesConfig {
    pub async fn init(path: &Path) {
        let cfg = Self::from_file_async(path)
            .await
            .unwrap_or_else(|e| panic!("failed to load route config from {:?}: {e}", path));

        ROUTES
            .set(Arc::new(RwLock::new(cfg)))
            .unwrap_or_else(|_| panic!("RoutesConfig::init called twice"));
    }

    pub async fn reload(path: &Path) -> Result<(), RoutesError> {
        let next = Self::from_file_async(path).await?;
        let handle = Self::handle();
        *handle.write() = next;
        Ok(())
    }

    pub fn snapshot() -> RoutesConfig {
        Self::handle().read().clone()
    }

    pub fn cassandra_route() -> Option<CassandraRouteEntry> {
        Self::handle().read().cassandra.clone()
    }

    pub fn mongo_route() -> Option<MongoRouteEntry> {
        Self::handle().read().mongo.clone()
    }

    fn handle() -> Arc<RwLock<RoutesConfig>> {
        ROUTES
            .get()
            .expect("RoutesConfig not initialized; call RoutesConfig::init().await first")
            .clone()
    }

    async fn from_file_async(path: &Path) -> Result<RoutesConfig, RoutesError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RoutesError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> Result<RoutesConfig, RoutesError> {
        let doc: RoutesFile = toml::from_str(raw).map_err(|e| RoutesError::Toml { source: e })?;

        Ok(RoutesConfig {
            postgres_routes: doc.postgres.map(|p| p.routes).unwrap_or_default(),
            cassandra: doc.cassandra,
            mongo: doc.mongo,
        })
    }
}

/// Resolves a PG Session to a Route by matching `database_name` against the
/// route table, exact match first, `*` wildcard as fallback (§6.3).
impl RouteResolver for RoutesConfig {
    fn resolve(&self, session: &Session) -> Option<Route> {
        if session.protocol != Protocol::Postgres {
            return None;
        }

        let db_name = session.database_name.as_deref().unwrap_or("");

        let entry = self
            .postgres_routes
            .iter()
            .find(|r| r.database == db_name)
            .or_else(|| self.postgres_routes.iter().find(|r| r.database == "*"))?;

        Some(entry.to_route())
    }
}

// -----------------------------------------------------------------------------
// ----- On-disk format ----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct RoutesFile {
    postgres: Option<PostgresSection>,
    cassandra: Option<CassandraRouteEntry>,
    mongo: Option<MongoRouteEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct PostgresSection {
    #[serde(default)]
    routes: Vec<PgRouteEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PgRouteEntry {
    pub database: String,
    pub host: String,
    pub port: u16,
    pub backend_user: String,
    pub backend_database: String,
    pub server_name: Option<String>,
    pub ca_path: Option<String>,
    pub krb5_config_path: Option<String>,
    pub ticket_cache_path: Option<String>,
    pub client_principal: Option<String>,
    pub service_principal: Option<String>,
}

impl PgRouteEntry {
    fn to_route(&self) -> Route {
        let service_principal = self
            .service_principal
            .clone()
            .unwrap_or_else(|| Route::default_service_principal(Protocol::Postgres, &self.host));

        Route {
            host: self.host.clone(),
            port: self.port,
            backend_user: self.backend_user.clone(),
            backend_database: self.backend_database.clone(),
            ca_path: self.ca_path.clone(),
            server_name: self.server_name.clone(),
            krb5_config_path: self.krb5_config_path.clone(),
            ticket_cache_path: self.ticket_cache_path.clone(),
            client_principal: self.client_principal.clone(),
            service_principal,
            expected_username: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CassandraRouteEntry {
    pub host: String,
    pub port: u16,
    pub expected_username: Option<String>,
    pub krb5_config_path: Option<String>,
    pub ticket_cache_path: Option<String>,
    pub client_principal: Option<String>,
    pub service_principal: Option<String>,
}

impl CassandraRouteEntry {
    pub fn to_route(&self) -> Route {
        let service_principal = self
            .service_principal
            .clone()
            .unwrap_or_else(|| Route::default_service_principal(Protocol::Cassandra, &self.host));

        Route {
            host: self.host.clone(),
            port: self.port,
            backend_user: String::new(),
            backend_database: String::new(),
            ca_path: None,
            server_name: None,
            krb5_config_path: self.krb5_config_path.clone(),
            ticket_cache_path: self.ticket_cache_path.clone(),
            client_principal: self.client_principal.clone(),
            service_principal,
            expected_username: self.expected_username.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoRouteEntry {
    pub host: String,
    pub port: u16,
}

// -----------------------------------------------------------------------------
// ----- Errors --------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RoutesError {
    #[error("read error for {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("toml parse error: {source}")]
    Toml { source: toml::de::Error },
}
