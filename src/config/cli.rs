use clap::Parser;
use parking_lot::RwLock;
use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use super::types::LogLevel;

// -----------------------------------------------------------------------------
// ----- Global Singleton ------------------------------------------------------

static CLI_CONFIG: OnceLock<Arc<RwLock<CliConfig>>> = OnceLock::new();

// -----------------------------------------------------------------------------
// ----- CliConfig -------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CliConfig {
    pub pg_listen_addr: Option<SocketAddr>,
    pub cassandra_listen_addr: Option<SocketAddr>,
    pub mongo_listen_addr: Option<SocketAddr>,
    pub routes_file: PathBuf,
    pub log_level: LogLevel,
}

impl CliConfig {
    pub fn init() {
        CLI_CONFIG.get_or_init(|| {
            let cfg = Self::from_args();
            cfg.validate();
            Arc::new(RwLock::new(cfg))
        });
    }

    pub fn snapshot() -> CliConfig {
        handle().read().clone()
    }
}

// -----------------------------------------------------------------------------
// ----- CliConfig: Private ----------------------------------------------------

impl CliConfig {
    fn from_args() -> Self {
        let args = Args::try_parse().unwrap_or_else(|e| panic!("Invalid CLI/ENV: {e}"));

        Self {
            pg_listen_addr: args.pg_host.zip(args.pg_port).map(SocketAddr::from),
            cassandra_listen_addr: args
                .cassandra_host
                .zip(args.cassandra_port)
                .map(SocketAddr::from),
            mongo_listen_addr: args.mongo_host.zip(args.mongo_port).map(SocketAddr::from),
            routes_file: args.routes_file,
            log_level: args.log_level,
        }
    }

    fn validate(&self) {
        must_exist_file(&self.routes_file, "--routes / routes.toml");

        if self.pg_listen_addr.is_none()
            && self.cassandra_listen_addr.is_none()
            && self.mongo_listen_addr.is_none()
        {
            panic!(
                "at least one of --pg-host/--pg-port, --cassandra-host/--cassandra-port, --mongo-host/--mongo-port is required"
            );
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Args ------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "protoproxy", version, about = "Multi-protocol database proxy")]
struct Args {
    #[arg(long = "pg-host", env = "PGPROX_PG_HOST")]
    pg_host: Option<IpAddr>,
    #[arg(long = "pg-port", env = "PGPROX_PG_PORT")]
    pg_port: Option<u16>,

    #[arg(long = "cassandra-host", env = "PGPROX_CASSANDRA_HOST")]
    cassandra_host: Option<IpAddr>,
    #[arg(long = "cassandra-port", env = "PGPROX_CASSANDRA_PORT")]
    cassandra_port: Option<u16>,

    #[arg(long = "mongo-host", env = "PGPROX_MONGO_HOST")]
    mongo_host: Option<IpAddr>,
    #[arg(long = "mongo-port", env = "PGPROX_MONGO_PORT")]
    mongo_port: Option<u16>,

    // Not required via CLI or ENV (defaults to info).
    #[arg(long = "log", default_value = "info")]
    log_level: LogLevel,

    // Must exist; no defaults.
    #[arg(long = "routes", env = "PGPROX_ROUTES_FILE")]
    routes_file: PathBuf,
}

// -----------------------------------------------------------------------------
// ----- Private Utils ---------------------------------------------------------

fn handle() -> Arc<RwLock<CliConfig>> {
    CLI_CONFIG
        .get()
        .expect("config not initialized; call CliConfig::init() first")
        .clone()
}

fn must_exist_file(path: &Path, hint: &str) {
    let md = fs::metadata(path).unwrap_or_else(|_| {
        panic!("required file missing: {} (from {hint})", path.display());
    });

    if !md.is_file() {
        panic!("path is not a file: {} (from {hint})", path.display());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
