//! PG Frontend State (§4.5). Per-connection handler over a stream of whole
//! frames: handles startup, drops client passwords, buffers until the
//! backend is ready, then forwards.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::audit::QueryEvent;
use crate::pg::message::{self, FrontendMessage, MessageError};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgStage {
    Startup,
    Buffering,
    Ready,
}

/// What the connection driver should do in response to one client frame.
#[derive(Debug, Default)]
pub struct FrontendOutcome {
    /// Write directly back to the client (e.g. `N`, an `ErrorResponse`).
    pub reply_to_client: Vec<Bytes>,
    /// Startup parameters just latched; the driver should now dial the backend.
    pub dial_backend: Option<Vec<(String, String)>>,
    /// A CancelRequest was just seen: the driver should dial the resolved
    /// route and forward this raw frame verbatim, with no backend handshake
    /// (§4.5 CancelRequest row; the backend never replies to a cancel).
    pub dial_for_cancel: Option<Bytes>,
    /// A query/command observed for audit.
    pub query_event: Option<QueryEvent>,
    /// Ready-mode only: forward this frame to the backend immediately.
    pub forward_to_backend: Option<Bytes>,
    /// Close the connection after flushing any reply.
    pub close: bool,
}

/// Rewrites a `Query` SQL string before it is forwarded, and/or vetoes
/// forwarding. The default no-op logger forwards unchanged.
pub trait QueryLogger: Send {
    fn on_query(&mut self, sql: &str) -> Option<String> {
        let _ = sql;
        None
    }
}

#[derive(Debug, Default)]
pub struct NoopQueryLogger;
impl QueryLogger for NoopQueryLogger {}

/// Owns the pending queue and drives the table in §4.5.
pub struct PgFrontendState {
    stage: PgStage,
    pending: VecDeque<Bytes>,
}

impl PgFrontendState {
    pub fn new() -> Self {
        Self {
            stage: PgStage::Startup,
            pending: VecDeque::new(),
        }
    }

    pub fn stage(&self) -> PgStage {
        self.stage
    }

    /// Handle one whole frame from the client. `frame` must have come from a
    /// `FrameSplitter` in the matching mode (startup-shape while
    /// `stage == Startup`, typed-shape otherwise).
    pub fn handle_frame(
        &mut self,
        frame: &[u8],
        session: &mut Session,
        logger: &mut dyn QueryLogger,
    ) -> Result<FrontendOutcome, MessageError> {
        let in_startup = self.stage == PgStage::Startup;
        let message = message::parse_frontend(frame, in_startup)?;
        Ok(self.apply(message, frame, session, logger))
    }

    fn apply(
        &mut self,
        message: FrontendMessage,
        raw_frame: &[u8],
        session: &mut Session,
        logger: &mut dyn QueryLogger,
    ) -> FrontendOutcome {
        let mut outcome = FrontendOutcome::default();

        match message {
            FrontendMessage::SslRequest | FrontendMessage::GssEncRequest => {
                outcome.reply_to_client.push(message::ssl_not_supported());
            }
            FrontendMessage::StartupMessage { params, .. } => {
                session.apply_pg_startup(&params);
                self.stage = PgStage::Buffering;
                outcome.dial_backend = Some(params);
            }
            FrontendMessage::CancelRequest { .. } => {
                // Best-effort: forwarded as-is to the resolved route, dialed
                // directly since no backend handshake is expected for a
                // cancel. Full cancel routing via a (pid, secret) side
                // connection is a declared non-goal (§9).
                self.stage = PgStage::Buffering;
                outcome.dial_for_cancel = Some(Bytes::copy_from_slice(raw_frame));
            }
            FrontendMessage::PasswordMessage(_) => {
                // Dropped: the proxy owns backend identity and never
                // forwards client-presented credentials.
            }
            FrontendMessage::Query(sql) => {
                let rewritten = logger.on_query(&sql);
                let to_forward = match &rewritten {
                    Some(new_sql) => message::encode_query(new_sql),
                    None => Bytes::copy_from_slice(raw_frame),
                };
                outcome.query_event = Some(QueryEvent::new(rewritten.unwrap_or(sql)));
                self.enqueue_or_return(to_forward, &mut outcome);
            }
            FrontendMessage::Terminate => {
                self.enqueue_or_return(Bytes::copy_from_slice(raw_frame), &mut outcome);
                outcome.close = true;
            }
            _ => {
                // Parse/Bind/Execute/Describe/Close/Sync/Flush/Copy*/FunctionCall/Unknown:
                // forward unchanged.
                self.enqueue_or_return(Bytes::copy_from_slice(raw_frame), &mut outcome);
            }
        }

        outcome
    }

    fn enqueue_or_return(&mut self, frame: Bytes, outcome: &mut FrontendOutcome) {
        match self.stage {
            PgStage::Ready => outcome.forward_to_backend = Some(frame),
            _ => self.pending.push_back(frame),
        }
    }

    /// Called exactly once when the backend signals AuthenticationOk.
    /// Drains the pending queue in enqueue order; never re-populated after.
    pub fn mark_ready(&mut self) -> Vec<Bytes> {
        self.stage = PgStage::Ready;
        self.pending.drain(..).collect()
    }

    /// Frames accumulated so far without draining (used by the driver to
    /// inspect whether anything is pending).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for PgFrontendState {
    fn default() -> Self {
        Self::new()
    }
}
