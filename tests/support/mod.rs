use std::net::TcpListener as StdTcpListener;
use std::sync::{Arc, Mutex};

use protoproxy::{AuditRecorder, Route, RouteResolver, Session};

/// Binds an ephemeral port and immediately releases it, mirroring the
/// teacher's `reserve_port` helper (`pgcrab`'s `tests/support`).
pub fn reserve_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().unwrap().port()
}

/// A `RouteResolver` that always returns the same fixed route, for tests
/// that only need one backend target.
pub struct FixedResolver(pub Route);

impl RouteResolver for FixedResolver {
    fn resolve(&self, _session: &Session) -> Option<Route> {
        Some(self.0.clone())
    }
}

pub fn pg_route(port: u16) -> Route {
    Route {
        host: "127.0.0.1".into(),
        port,
        backend_user: "alice".into(),
        backend_database: "sales".into(),
        ca_path: None,
        server_name: None,
        krb5_config_path: None,
        ticket_cache_path: None,
        client_principal: None,
        service_principal: "postgres/127.0.0.1".into(),
        expected_username: None,
    }
}

pub fn cassandra_route(port: u16) -> Route {
    Route {
        host: "127.0.0.1".into(),
        port,
        backend_user: String::new(),
        backend_database: String::new(),
        ca_path: None,
        server_name: None,
        krb5_config_path: None,
        ticket_cache_path: None,
        client_principal: None,
        service_principal: "cassandra/127.0.0.1".into(),
        expected_username: None,
    }
}

/// Captures every lifecycle/query/result event it receives so a test can
/// assert on the exact sequence afterwards. Safe for concurrent calls per
/// the `AuditRecorder` contract (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    SessionStart { error: bool },
    SessionEnd,
    Query(String),
    Result { affected: i64, error: bool },
}

#[derive(Default)]
pub struct RecordingAuditRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingAuditRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditRecorder for RecordingAuditRecorder {
    fn on_session_start(&self, _session: &Session, error: Option<&str>) {
        self.events.lock().unwrap().push(RecordedEvent::SessionStart {
            error: error.is_some(),
        });
    }

    fn on_session_end(&self, _session: &Session) {
        self.events.lock().unwrap().push(RecordedEvent::SessionEnd);
    }

    fn on_query(&self, _session: &Session, event: &protoproxy::audit::QueryEvent) {
        self.events
            .lock()
            .unwrap()
            .push(RecordedEvent::Query(event.query.clone()));
    }

    fn on_result(&self, _session: &Session, event: &protoproxy::audit::ResultEvent) {
        self.events.lock().unwrap().push(RecordedEvent::Result {
            affected: event.affected,
            error: event.error.is_some(),
        });
    }
}

/// Polls until a TCP connect to `addr` succeeds, matching the teacher's
/// `wait_for_listen` helper.
pub async fn wait_for_listen(addr: std::net::SocketAddr) {
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("nothing listening on {addr}");
}
