use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use protoproxy::{
    AuditRecorder, CassandraConnection, CliConfig, MongoConnection, PgConnection, Route,
    RouteResolver, RoutesConfig, Session, TracingAuditRecorder,
};

const APP_NAME: &str = "protoproxy";

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> std::io::Result<()> {
    CliConfig::init();
    init_tracing();

    let config = CliConfig::snapshot();
    RoutesConfig::init(&config.routes_file).await;

    let audit: Arc<dyn AuditRecorder> = Arc::new(TracingAuditRecorder);

    if let Some(addr) = config.pg_listen_addr {
        let audit = audit.clone();
        tokio::spawn(async move {
            if let Err(e) = run_pg_listener(addr, audit).await {
                error!(error = %e, "postgres listener exited");
            }
        });
        info!("{APP_NAME} :: postgres listening on {addr}");
    }

    if let Some(addr) = config.cassandra_listen_addr {
        let audit = audit.clone();
        tokio::spawn(async move {
            if let Err(e) = run_cassandra_listener(addr, audit).await {
                error!(error = %e, "cassandra listener exited");
            }
        });
        info!("{APP_NAME} :: cassandra listening on {addr}");
    }

    if let Some(addr) = config.mongo_listen_addr {
        tokio::spawn(async move {
            if let Err(e) = run_mongo_listener(addr).await {
                error!(error = %e, "mongo listener exited");
            }
        });
        info!("{APP_NAME} :: mongo listening on {addr}");
    }

    signal::ctrl_c().await?;
    info!("{APP_NAME} :: shutting down");
    Ok(())
}

fn init_tracing() {
    let config = CliConfig::snapshot();
    let filter = EnvFilter::try_new(config.log_level.as_str()).unwrap();
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

// -----------------------------------------------------------------------------
// ----- Listener loops ----------------------------------------------------------

/// Resolves against whatever `RoutesConfig::snapshot()` returns at the moment
/// a connection dials its backend, so a `RoutesConfig::reload()` takes effect
/// for every new connection without restarting the listener.
struct LiveRoutes;

impl RouteResolver for LiveRoutes {
    fn resolve(&self, session: &Session) -> Option<Route> {
        RoutesConfig::snapshot().resolve(session)
    }
}

async fn run_pg_listener(addr: SocketAddr, audit: Arc<dyn AuditRecorder>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let resolver: Arc<dyn RouteResolver> = Arc::new(LiveRoutes);

    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let resolver = resolver.clone();
        let audit = audit.clone();

        tokio::spawn(async move {
            let conn = PgConnection::new(stream, peer.to_string(), resolver, audit);
            if let Err(e) = conn.serve().await {
                error!(error = %e, "pg connection error");
            }
        });
    }
}

async fn run_cassandra_listener(addr: SocketAddr, audit: Arc<dyn AuditRecorder>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);

        let Some(route_entry) = RoutesConfig::cassandra_route() else {
            error!(%peer, "cassandra connection rejected: no [cassandra] route configured");
            continue;
        };
        let audit = audit.clone();

        tokio::spawn(async move {
            let conn = CassandraConnection::new(stream, peer.to_string(), route_entry.to_route(), audit);
            if let Err(e) = conn.serve().await {
                error!(error = %e, "cassandra connection error");
            }
        });
    }
}

async fn run_mongo_listener(addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);

        let Some(route) = RoutesConfig::mongo_route() else {
            error!(%peer, "mongo connection rejected: no [mongo] route configured");
            continue;
        };

        tokio::spawn(async move {
            let conn = MongoConnection::new(stream, peer.to_string(), route);
            if let Err(e) = conn.serve().await {
                error!(error = %e, "mongo connection error");
            }
        });
    }
}
