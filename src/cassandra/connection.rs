//! Connection driver for the Cassandra engine ([EXPANDED] per SPEC_FULL.md
//! §4: "Connection drivers"). Sequences the framer, handshake state machine,
//! GSS authenticator, and failed-handshake responder into one runnable
//! per-connection task. Unlike the PG engine, Cassandra never detaches into
//! a raw byte pump after READY: §4.11's `[Ready]` state keeps parsing every
//! frame for audit, so this loop runs for the life of the connection.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{instrument, warn};

use crate::audit::{AuditRecorder, SessionLifecycleGuard};
use crate::cassandra::failed_handshake::FailedHandshakeResponder;
use crate::cassandra::frame::{CassandraFramer, FramingError};
use crate::cassandra::handshake::CassandraHandshake;
use crate::cassandra::message;
use crate::gssapi::GssAuthenticator;
use crate::pump;
use crate::route::Route;
use crate::session::{Protocol, Session};

const READ_CHUNK: usize = 8192;

pub struct CassandraConnection {
    stream: TcpStream,
    peer: String,
    route: Route,
    audit: Arc<dyn AuditRecorder>,
}

impl CassandraConnection {
    pub fn new(stream: TcpStream, peer: String, route: Route, audit: Arc<dyn AuditRecorder>) -> Self {
        Self { stream, peer, route, audit }
    }

    #[instrument(skip(self), fields(peer = %self.peer))]
    pub async fn serve(mut self) -> std::io::Result<()> {
        let mut session = Session::new(self.peer.clone(), Protocol::Cassandra);
        session.apply_route(&self.route.service_principal, "cassandra", "cassandra");
        let guard = SessionLifecycleGuard::new();

        match TcpStream::connect((self.route.host.as_str(), self.route.port)).await {
            Ok(backend) => self.run_with_backend(session, guard, backend).await,
            Err(e) => {
                warn!(error = %e, "cassandra backend dial failed");
                self.run_failed_handshake(session, guard, "Backend connection failed").await
            }
        }
    }

    /// §4.12: drive the client through exactly one canonical handshake turn,
    /// then close. No backend connection exists in this path.
    async fn run_failed_handshake(
        mut self,
        mut session: Session,
        mut guard: SessionLifecycleGuard,
        reason: &str,
    ) -> std::io::Result<()> {
        if guard.mark_started() {
            self.audit.on_session_start(&session, Some(reason));
        }

        let responder = FailedHandshakeResponder::new(reason);
        let mut framer = CassandraFramer::new();
        let mut inbox = BytesMut::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            inbox.extend_from_slice(&chunk[..n]);

            while let Some(frame) = framer.read_legacy(&mut inbox).map_err(io_err)? {
                let Some(outcome) = responder.on_client_frame(&frame) else {
                    continue;
                };
                if let Some(reply) = outcome.reply_to_client {
                    self.stream.write_all(&reply).await?;
                }
                if outcome.close_on_flush {
                    let _ = pump::close_on_flush(&mut self.stream, &[]).await;
                    if guard.mark_ended() {
                        self.audit.on_session_end(&session);
                    }
                    return Ok(());
                }
            }
        }

        if guard.mark_ended() {
            self.audit.on_session_end(&session);
        }
        Ok(())
    }

    async fn run_with_backend(
        mut self,
        mut session: Session,
        mut guard: SessionLifecycleGuard,
        mut backend: TcpStream,
    ) -> std::io::Result<()> {
        let mut handshake = CassandraHandshake::new(self.route.expected_username.clone());
        let mut frontend_framer = CassandraFramer::new();
        let mut backend_framer = CassandraFramer::new();
        let mut frontend_inbox = BytesMut::new();
        let mut backend_inbox = BytesMut::new();
        let mut gss: Option<GssAuthenticator> = None;

        let mut fe_chunk = [0u8; READ_CHUNK];
        let mut be_chunk = [0u8; READ_CHUNK];

        loop {
            tokio::select! {
                read_res = self.stream.read(&mut fe_chunk) => {
                    let n = read_res?;
                    if n == 0 {
                        let _ = backend.shutdown().await;
                        if guard.mark_ended() { self.audit.on_session_end(&session); }
                        return Ok(());
                    }
                    frontend_inbox.extend_from_slice(&fe_chunk[..n]);

                    let frames = match drain_frames(&mut frontend_framer, &mut frontend_inbox) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(error = %e, "cassandra client framing error");
                            return self.bail_out(&mut session, &mut guard, &e.to_string()).await;
                        }
                    };

                    for frame in frames {
                        let outcome = match handshake.on_client_frame(&frame, &mut session) {
                            Ok(o) => o,
                            Err(e) => {
                                warn!(error = %e, "cassandra client parse error");
                                return self.bail_out(&mut session, &mut guard, &e.to_string()).await;
                            }
                        };

                        if let Some(event) = &outcome.query_event {
                            self.audit.on_query(&session, event);
                        }
                        for reply in &outcome.reply_to_client {
                            let wrapped = wrap_for_write(&frontend_framer, reply).map_err(io_err)?;
                            self.stream.write_all(&wrapped).await?;
                        }
                        if let Some(fwd) = &outcome.forward_to_backend {
                            let wrapped = wrap_for_write(&backend_framer, fwd).map_err(io_err)?;
                            backend.write_all(&wrapped).await?;
                        }
                        if outcome.close {
                            let _ = pump::close_on_flush(&mut self.stream, &[]).await;
                            let _ = backend.shutdown().await;
                            if guard.mark_ended() { self.audit.on_session_end(&session); }
                            return Ok(());
                        }
                    }
                }

                read_res = backend.read(&mut be_chunk) => {
                    let n = read_res?;
                    if n == 0 {
                        return self.bail_out(&mut session, &mut guard, "backend connection closed").await;
                    }
                    backend_inbox.extend_from_slice(&be_chunk[..n]);

                    let frames = match drain_frames(&mut backend_framer, &mut backend_inbox) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(error = %e, "cassandra backend framing error");
                            return self.bail_out(&mut session, &mut guard, &e.to_string()).await;
                        }
                    };

                    for frame in frames {
                        let outcome = match handshake.on_backend_frame(&frame) {
                            Ok(o) => o,
                            Err(e) => {
                                warn!(error = %e, "cassandra backend parse error");
                                return self.bail_out(&mut session, &mut guard, &e.to_string()).await;
                            }
                        };

                        if let Some(fwd) = &outcome.forward_to_client {
                            let wrapped = wrap_for_write(&frontend_framer, fwd).map_err(io_err)?;
                            self.stream.write_all(&wrapped).await?;
                        }

                        if outcome.switch_framing {
                            let v = handshake.protocol_version();
                            frontend_framer.switch_to_modern_framing_read(v);
                            frontend_framer.switch_to_modern_framing_write(v);
                            backend_framer.switch_to_modern_framing_read(v);
                            backend_framer.switch_to_modern_framing_write(v);
                        }
                        if let Some(c) = outcome.negotiated_compression {
                            frontend_framer.update_compression(c);
                            backend_framer.update_compression(c);
                        }

                        if outcome.need_initial_gss_token {
                            let route = self.route.clone();
                            let login = tokio::task::spawn_blocking(move || -> Result<_, String> {
                                let mut g = GssAuthenticator::login(&route).map_err(|e| e.to_string())?;
                                let token = g.initial_token().map_err(|e| e.to_string())?;
                                Ok((g, token))
                            })
                            .await;

                            match login {
                                Ok(Ok((authenticator, token))) => {
                                    gss = Some(authenticator);
                                    let resp = message::encode_auth_response(
                                        handshake.protocol_version(),
                                        outcome.stream_id,
                                        &token,
                                    );
                                    let wrapped = wrap_for_write(&backend_framer, &resp).map_err(io_err)?;
                                    backend.write_all(&wrapped).await?;
                                }
                                Ok(Err(e)) => {
                                    return self.bail_out(&mut session, &mut guard, &e).await;
                                }
                                Err(e) => {
                                    return self.bail_out(&mut session, &mut guard, &e.to_string()).await;
                                }
                            }
                        }

                        if let Some(server_token) = outcome.need_gss_continuation {
                            let Some(mut authenticator) = gss.take() else {
                                return self
                                    .bail_out(&mut session, &mut guard, "GSS continuation without a context")
                                    .await;
                            };
                            let challenge = tokio::task::spawn_blocking(move || {
                                let t = authenticator.challenge(&server_token);
                                (authenticator, t)
                            })
                            .await;

                            match challenge {
                                Ok((authenticator, Ok(token))) => {
                                    gss = Some(authenticator);
                                    let resp = message::encode_auth_response(
                                        handshake.protocol_version(),
                                        outcome.stream_id,
                                        &token,
                                    );
                                    let wrapped = wrap_for_write(&backend_framer, &resp).map_err(io_err)?;
                                    backend.write_all(&wrapped).await?;
                                }
                                Ok((_, Err(e))) => {
                                    return self.bail_out(&mut session, &mut guard, &e.to_string()).await;
                                }
                                Err(e) => {
                                    return self.bail_out(&mut session, &mut guard, &e.to_string()).await;
                                }
                            }
                        }

                        if outcome.mark_ready {
                            if guard.mark_started() {
                                self.audit.on_session_start(&session, None);
                            }
                            for pending in handshake.drain_pending() {
                                let wrapped = wrap_for_write(&backend_framer, &pending).map_err(io_err)?;
                                backend.write_all(&wrapped).await?;
                            }
                        }

                        if outcome.close {
                            return self.bail_out(&mut session, &mut guard, "backend error").await;
                        }
                    }
                }
            }
        }
    }

    /// Common failure exit: guarantee `onSessionStart` fires at most once
    /// (possibly with an error, if the session never reached ready), close
    /// the frontend quietly, and guarantee `onSessionEnd` iff start fired.
    async fn bail_out(
        &mut self,
        session: &mut Session,
        guard: &mut SessionLifecycleGuard,
        reason: &str,
    ) -> std::io::Result<()> {
        if guard.mark_started() {
            self.audit.on_session_start(session, Some(reason));
        }
        let _ = pump::close_quietly(&mut self.stream).await;
        if guard.mark_ended() {
            self.audit.on_session_end(session);
        }
        Ok(())
    }
}

/// Drains every whole inner frame currently buffered, regardless of whether
/// the channel is in legacy or modern framing mode.
fn drain_frames(framer: &mut CassandraFramer, buf: &mut BytesMut) -> Result<Vec<BytesMut>, FramingError> {
    let mut frames = Vec::new();
    loop {
        if framer.modern_framing_read {
            let batch = framer.read_modern(buf)?;
            if batch.is_empty() {
                break;
            }
            frames.extend(batch);
        } else {
            match framer.read_legacy(buf)? {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
    }
    Ok(frames)
}

/// Wraps a legacy-shaped inner frame for the wire, segmenting it if the
/// channel has switched to modern (v5+) framing.
fn wrap_for_write(framer: &CassandraFramer, raw: &[u8]) -> Result<Bytes, FramingError> {
    if framer.modern_framing_write {
        framer.write_modern(raw)
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}

fn io_err(e: FramingError) -> std::io::Error {
    std::io::Error::other(e.to_string())
}
