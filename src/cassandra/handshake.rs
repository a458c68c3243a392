//! Cassandra Handshake State Machine (§4.11). Deliberately I/O-free, mirroring
//! `pg::backend::BackendHandshake`: decides what to do with each client/backend
//! frame, leaving all socket and GSS-token work to the connection driver.

use std::collections::VecDeque;

use bytes::Bytes;
use thiserror::Error;

use crate::audit::QueryEvent;
use crate::cassandra::frame::Compression;
use crate::cassandra::message::{self, FrameHeader, MessageError};
use crate::session::Session;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("frame too short")]
    TooShort,
    #[error("{0}")]
    Message(#[from] MessageError),
}

#[derive(Debug, Default)]
pub struct ClientOutcome {
    pub forward_to_backend: Option<Bytes>,
    pub reply_to_client: Vec<Bytes>,
    pub query_event: Option<QueryEvent>,
    pub close: bool,
}

#[derive(Debug, Default)]
pub struct BackendOutcome {
    pub forward_to_client: Option<Bytes>,
    pub switch_framing: bool,
    pub negotiated_compression: Option<Compression>,
    pub need_initial_gss_token: bool,
    pub need_gss_continuation: Option<Vec<u8>>,
    pub mark_ready: bool,
    pub close: bool,
    /// Stream-id to echo when the proxy originates its own AUTH_RESPONSE.
    pub stream_id: i16,
}

/// Holds the pending queue, latched protocol-version/compression, and the
/// ready flag; §3's "Cassandra Handshake State".
pub struct CassandraHandshake {
    protocol_version: u8,
    version_latched: bool,
    compression: Option<Compression>,
    ready: bool,
    expected_username: Option<String>,
    pending: VecDeque<Bytes>,
}

impl CassandraHandshake {
    pub fn new(expected_username: Option<String>) -> Self {
        Self {
            protocol_version: 4,
            version_latched: false,
            compression: None,
            ready: false,
            expected_username,
            pending: VecDeque::new(),
        }
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn on_client_frame(&mut self, raw: &[u8], session: &mut Session) -> Result<ClientOutcome, HandshakeError> {
        let header = FrameHeader::parse(raw).ok_or(HandshakeError::TooShort)?;
        let body = FrameHeader::body(raw);
        let mut outcome = ClientOutcome::default();

        if self.ready {
            if let Some(detail) = message::audit_detail(header.opcode, body) {
                outcome.query_event = Some(QueryEvent::new(detail));
            }
            outcome.forward_to_backend = Some(Bytes::copy_from_slice(raw));
            return Ok(outcome);
        }

        // Latched on the first client frame only (§3): a later frame
        // carrying a different version byte must not override it.
        if !self.version_latched {
            self.protocol_version = header.version;
            self.version_latched = true;
        }

        match header.opcode {
            message::OP_OPTIONS => {
                outcome.forward_to_backend = Some(Bytes::copy_from_slice(raw));
            }
            message::OP_STARTUP => {
                if let Ok(opts) = message::parse_startup(body) {
                    if let Some(c) = opts.compression.as_deref() {
                        self.compression = Some(Compression::from_negotiated(c));
                    }
                    session.apply_cassandra_driver(opts.driver_name.as_deref(), opts.driver_version.as_deref());
                }
                outcome.forward_to_backend = Some(Bytes::copy_from_slice(raw));
            }
            message::OP_AUTH_RESPONSE => {
                // Dropped: the proxy owns backend identity via GSS and never
                // forwards client-presented credentials.
                if let Ok(message::AuthResponseBody::Password { username, .. }) = message::parse_auth_response(body) {
                    match &self.expected_username {
                        Some(expected) if expected != &username => {
                            outcome.reply_to_client.push(message::encode_error(
                                header.version,
                                header.stream_id,
                                message::AUTH_ERROR_CODE,
                                "username mismatch",
                            ));
                            outcome.close = true;
                        }
                        _ => {
                            session.database_user = Some(username);
                        }
                    }
                }
            }
            _ => {
                self.pending.push_back(Bytes::copy_from_slice(raw));
            }
        }

        Ok(outcome)
    }

    pub fn on_backend_frame(&mut self, raw: &[u8]) -> Result<BackendOutcome, HandshakeError> {
        let header = FrameHeader::parse(raw).ok_or(HandshakeError::TooShort)?;
        let mut outcome = BackendOutcome {
            stream_id: header.stream_id,
            ..Default::default()
        };

        match header.opcode {
            message::OP_SUPPORTED => {
                outcome.forward_to_client = Some(Bytes::copy_from_slice(raw));
            }
            message::OP_AUTHENTICATE => {
                outcome.forward_to_client = Some(Bytes::copy_from_slice(raw));
                outcome.switch_framing = true;
                outcome.negotiated_compression = self.compression;
                outcome.need_initial_gss_token = true;
            }
            message::OP_AUTH_CHALLENGE => {
                outcome.forward_to_client = Some(Bytes::copy_from_slice(raw));
                let body = FrameHeader::body(raw);
                outcome.need_gss_continuation = Some(message::parse_auth_challenge(body)?);
            }
            message::OP_AUTH_SUCCESS => {
                outcome.forward_to_client = Some(Bytes::copy_from_slice(raw));
                outcome.switch_framing = true;
                outcome.negotiated_compression = self.compression;
                outcome.mark_ready = true;
                self.ready = true;
            }
            message::OP_READY => {
                outcome.forward_to_client = Some(Bytes::copy_from_slice(raw));
                outcome.switch_framing = true;
                outcome.negotiated_compression = self.compression;
                outcome.mark_ready = true;
                self.ready = true;
            }
            message::OP_ERROR => {
                outcome.forward_to_client = Some(Bytes::copy_from_slice(raw));
                outcome.close = true;
            }
            _ => {
                outcome.forward_to_client = Some(Bytes::copy_from_slice(raw));
            }
        }

        Ok(outcome)
    }

    /// Drains the pending queue in enqueue order; never re-populated after.
    pub fn drain_pending(&mut self) -> Vec<Bytes> {
        self.pending.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
