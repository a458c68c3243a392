use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

// -----------------------------------------------------------------------------
// ----- Protocol ----------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Postgres,
    Cassandra,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Postgres => "postgres",
            Protocol::Cassandra => "cassandra",
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Session -----------------------------------------------------------------

/// Per-accepted-connection identity and metadata record, handed to the audit
/// recorder at the lifecycle points of §4.2.
#[derive(Clone, Debug, Serialize)]
pub struct Session {
    pub id: u64,
    pub created_at_unix_ms: u64,
    pub client_address: String,
    pub protocol: Protocol,

    pub database_user: Option<String>,
    pub database_name: Option<String>,
    pub application_name: Option<String>,
    /// Wire order preserved (§3 "ordered mapping"); a repeated key is kept
    /// as-is rather than deduped.
    pub startup_parameters: Vec<(String, String)>,

    pub user_agent: Option<String>,
    pub driver_name: Option<String>,
    pub driver_version: Option<String>,

    pub database_service: Option<String>,
    pub database_type: Option<String>,
    pub database_protocol: Option<String>,

    pub cluster: Option<String>,
    pub host_id: Option<String>,
    pub roles: Option<Vec<String>>,
    pub lock_targets: Option<Vec<String>>,
    pub auto_create_user_mode: Option<String>,
    pub postgres_pid: Option<i32>,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl Session {
    pub fn new(client_address: String, protocol: Protocol) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let created_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            id,
            created_at_unix_ms,
            client_address,
            protocol,
            database_user: None,
            database_name: None,
            application_name: None,
            startup_parameters: Vec::new(),
            user_agent: None,
            driver_name: None,
            driver_version: None,
            database_service: None,
            database_type: None,
            database_protocol: None,
            cluster: None,
            host_id: None,
            roles: None,
            lock_targets: None,
            auto_create_user_mode: None,
            postgres_pid: None,
        }
    }

    /// Latch startup parameters from a PG `StartupMessage` into the session.
    pub fn apply_pg_startup(&mut self, params: &[(String, String)]) {
        let lookup = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        self.database_user = lookup("user");
        self.database_name = lookup("database");
        self.application_name = lookup("application_name");
        self.startup_parameters = params.to_vec();
    }

    /// Latch driver identity from a Cassandra STARTUP body.
    pub fn apply_cassandra_driver(&mut self, driver_name: Option<&str>, driver_version: Option<&str>) {
        self.driver_name = driver_name.map(str::to_owned);
        self.driver_version = driver_version.map(str::to_owned);
        if let (Some(name), Some(version)) = (driver_name, driver_version) {
            self.user_agent = Some(format!("{name}/{version}"));
        }
    }

    pub fn apply_route(&mut self, service: &str, db_type: &str, db_protocol: &str) {
        self.database_service = Some(service.to_owned());
        self.database_type = Some(db_type.to_owned());
        self.database_protocol = Some(db_protocol.to_owned());
    }
}
