use serde::Serialize;
use tracing::{error, info};

use crate::session::Session;

// -----------------------------------------------------------------------------
// ----- Event payloads (§6.4) -------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct QueryEvent {
    pub query: String,
    pub parameters: Option<Vec<String>>,
    pub database: Option<String>,
    pub error: Option<String>,
}

impl QueryEvent {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            parameters: None,
            database: None,
            error: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ResultEvent {
    pub affected: i64,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl ResultEvent {
    pub fn ok(affected: i64) -> Self {
        Self {
            affected,
            message: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            affected: 0,
            message: None,
            error: Some(message.into()),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- AuditRecorder (§4.2) ---------------------------------------------------

/// External collaborator receiving lifecycle events. Shared across
/// connections (§5): implementations must be safe for concurrent calls or
/// serialize internally. Calls here must never propagate into the pipeline;
/// recorders log-and-swallow.
pub trait AuditRecorder: Send + Sync {
    fn on_session_start(&self, session: &Session, error: Option<&str>);
    fn on_session_end(&self, session: &Session);
    fn on_query(&self, session: &Session, event: &QueryEvent);
    fn on_result(&self, session: &Session, event: &ResultEvent);
}

// -----------------------------------------------------------------------------
// ----- TracingAuditRecorder ---------------------------------------------------

/// Default log-and-swallow recorder: renders each event as a structured
/// `tracing` event. Formatting the event stream (JSON lines, plaintext, a
/// remote sink) is a subscriber concern, left to the binary's `tracing-subscriber`
/// setup.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditRecorder;

impl AuditRecorder for TracingAuditRecorder {
    fn on_session_start(&self, session: &Session, error: Option<&str>) {
        match error {
            Some(err) => error!(
                event = "db.session.start.error",
                session_id = session.id,
                client = %session.client_address,
                db_user = session.database_user.as_deref().unwrap_or(""),
                db_name = session.database_name.as_deref().unwrap_or(""),
                app = session.application_name.as_deref().unwrap_or(""),
                error = err,
                "session start failed"
            ),
            None => info!(
                event = "db.session.start",
                session_id = session.id,
                client = %session.client_address,
                db_user = session.database_user.as_deref().unwrap_or(""),
                db_name = session.database_name.as_deref().unwrap_or(""),
                app = session.application_name.as_deref().unwrap_or(""),
                "session started"
            ),
        }
    }

    fn on_session_end(&self, session: &Session) {
        info!(
            event = "db.session.end",
            session_id = session.id,
            client = %session.client_address,
            "session ended"
        );
    }

    fn on_query(&self, session: &Session, event: &QueryEvent) {
        info!(
            event = "db.query",
            session_id = session.id,
            query = %event.query,
            database = event.database.as_deref().unwrap_or(""),
            error = event.error.as_deref().unwrap_or(""),
            "query observed"
        );
    }

    fn on_result(&self, session: &Session, event: &ResultEvent) {
        info!(
            event = "db.result",
            session_id = session.id,
            affected = event.affected,
            message = event.message.as_deref().unwrap_or(""),
            error = event.error.as_deref().unwrap_or(""),
            "result observed"
        );
    }
}

// -----------------------------------------------------------------------------
// ----- SessionLifecycleGuard ---------------------------------------------------

/// Idempotency guard around `onSessionStart`/`onSessionEnd` (§3 Cassandra
/// Handshake State `sessionStarted` flag; §8 state-machine laws: start fires
/// at most once, end fires iff start fired).
#[derive(Debug, Default)]
pub struct SessionLifecycleGuard {
    started: bool,
    ended: bool,
}

impl SessionLifecycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time it's called; every subsequent call is a no-op.
    pub fn mark_started(&mut self) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        true
    }

    /// Returns `true` only if start had fired and end hasn't yet.
    pub fn mark_ended(&mut self) -> bool {
        if !self.started || self.ended {
            return false;
        }
        self.ended = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_fires_once() {
        let mut g = SessionLifecycleGuard::new();
        assert!(g.mark_started());
        assert!(!g.mark_started());
    }

    #[test]
    fn end_requires_prior_start_and_fires_once() {
        let mut g = SessionLifecycleGuard::new();
        assert!(!g.mark_ended());
        assert!(g.mark_started());
        assert!(g.mark_ended());
        assert!(!g.mark_ended());
    }
}
