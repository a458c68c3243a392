//! Connection driver for the PG engine (§4 expanded: "Connection drivers").
//! Sequences the named §4.3–§4.8 components into one runnable per-connection
//! task: peek/split -> parse -> handle -> dial -> handshake -> pump. Carries
//! no protocol semantics of its own.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{error, info, instrument, warn};

use crate::audit::{AuditRecorder, SessionLifecycleGuard};
use crate::errors::ErrorResponse as PgErrorResponse;
use crate::gssapi::GssAuthenticator;
use crate::pg::audit_observer;
use crate::pg::backend::{self, BackendHandshake, HandshakeEvent};
use crate::pg::frame::FrameSplitter;
use crate::pg::frontend::{NoopQueryLogger, PgFrontendState};
use crate::pg::message;
use crate::pump;
use crate::route::RouteResolver;
use crate::session::{Protocol, Session};
use crate::tls;

const READ_CHUNK: usize = 8192;

pub struct PgConnection {
    stream: TcpStream,
    peer: String,
    resolver: Arc<dyn RouteResolver>,
    audit: Arc<dyn AuditRecorder>,
}

impl PgConnection {
    pub fn new(
        stream: TcpStream,
        peer: String,
        resolver: Arc<dyn RouteResolver>,
        audit: Arc<dyn AuditRecorder>,
    ) -> Self {
        Self { stream, peer, resolver, audit }
    }

    #[instrument(skip(self), fields(peer = %self.peer))]
    pub async fn serve(mut self) -> std::io::Result<()> {
        let mut session = Session::new(self.peer.clone(), Protocol::Postgres);
        let mut guard = SessionLifecycleGuard::new();

        let mut splitter = FrameSplitter::frontend();
        let mut frontend_state = PgFrontendState::new();
        let mut logger = NoopQueryLogger;
        let mut inbox = BytesMut::new();

        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            inbox.extend_from_slice(&chunk[..n]);

            while let Some(frame) = match splitter.split(&mut inbox) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "invalid PG frontend frame");
                    self.fail_to_client(&mut session, &mut guard, "invalid frame").await?;
                    return Ok(());
                }
            } {
                let outcome = match frontend_state.handle_frame(&frame, &mut session, &mut logger) {
                    Ok(o) => o,
                    Err(e) => {
                        warn!(error = %e, "unparseable PG frontend message");
                        self.fail_to_client(&mut session, &mut guard, "invalid frame").await?;
                        return Ok(());
                    }
                };

                if let Some(event) = &outcome.query_event {
                    self.audit.on_query(&session, event);
                }

                for reply in &outcome.reply_to_client {
                    self.stream.write_all(reply).await?;
                }

                if let Some(raw) = outcome.dial_for_cancel {
                    return self.dial_and_forward_cancel(session, guard, raw).await;
                }

                if let Some(params) = outcome.dial_backend {
                    return self
                        .dial_and_run(session, guard, frontend_state, logger, splitter, inbox, params)
                        .await;
                }

                if outcome.close {
                    return Ok(());
                }
            }
        }

        if guard.mark_ended() {
            self.audit.on_session_end(&session);
        }
        Ok(())
    }

    async fn fail_to_client(
        &mut self,
        session: &mut Session,
        guard: &mut SessionLifecycleGuard,
        message: &str,
    ) -> std::io::Result<()> {
        if guard.mark_started() {
            self.audit.on_session_start(session, Some(message));
        }
        let reply = PgErrorResponse::protocol_violation(message).to_bytes();
        let _ = self.stream.write_all(&reply).await;
        let _ = self.stream.shutdown().await;
        if guard.mark_ended() {
            self.audit.on_session_end(session);
        }
        Ok(())
    }

    /// §4.5 CancelRequest row: resolve a route, dial the backend, forward the
    /// raw 16-byte CancelRequest verbatim, then close. The backend never
    /// replies to a cancel, so there is no handshake to drive here.
    async fn dial_and_forward_cancel(
        mut self,
        mut session: Session,
        mut guard: SessionLifecycleGuard,
        raw_frame: Bytes,
    ) -> std::io::Result<()> {
        let route = match self.resolver.resolve(&session) {
            Some(route) => route,
            None => {
                self.fail_to_client(&mut session, &mut guard, "no route for this connection").await?;
                return Ok(());
            }
        };
        session.apply_route(&route.service_principal, "postgres", "postgres");

        if guard.mark_started() {
            self.audit.on_session_start(&session, None);
        }

        let backend_stream = match TcpStream::connect((route.host.as_str(), route.port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cancel backend dial failed");
                if guard.mark_ended() {
                    self.audit.on_session_end(&session);
                }
                return Ok(());
            }
        };

        let mut backend = match tls::connect(&route, backend_stream).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cancel backend TLS handshake failed");
                if guard.mark_ended() {
                    self.audit.on_session_end(&session);
                }
                return Ok(());
            }
        };

        let _ = backend.write_all(&raw_frame).await;
        let _ = backend.shutdown().await;

        if guard.mark_ended() {
            self.audit.on_session_end(&session);
        }
        Ok(())
    }

    /// Resolve a route, dial the backend, drive TLS + GSS handshake to
    /// completion, then hand off to the byte pump (§4.6).
    async fn dial_and_run(
        mut self,
        mut session: Session,
        mut guard: SessionLifecycleGuard,
        mut frontend_state: PgFrontendState,
        mut logger: NoopQueryLogger,
        mut frontend_splitter: FrameSplitter,
        mut frontend_inbox: BytesMut,
        _startup_params: Vec<(String, String)>,
    ) -> std::io::Result<()> {
        let route = match self.resolver.resolve(&session) {
            Some(route) => route,
            None => {
                self.fail_to_client(&mut session, &mut guard, "no route for this connection").await?;
                return Ok(());
            }
        };
        session.apply_route(&route.service_principal, "postgres", "postgres");

        let backend_stream = match TcpStream::connect((route.host.as_str(), route.port)).await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "backend dial failed");
                self.fail_to_client(&mut session, &mut guard, "Backend connection failed").await?;
                return Ok(());
            }
        };

        let mut backend = match tls::connect(&route, backend_stream).await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "backend TLS handshake failed");
                self.fail_to_client(&mut session, &mut guard, "Backend connection failed").await?;
                return Ok(());
            }
        };

        let startup = backend::build_startup_message(&route);
        if let Err(e) = backend.write_all(&startup).await {
            error!(error = %e, "failed writing PG startup message");
            self.fail_to_client(&mut session, &mut guard, "Backend connection failed").await?;
            return Ok(());
        }

        let mut handshake = BackendHandshake::new();
        let mut gss: Option<GssAuthenticator> = None;
        let mut backend_splitter = FrameSplitter::backend();
        let mut backend_inbox = BytesMut::new();

        let mut fe_chunk = [0u8; READ_CHUNK];
        let mut be_chunk = [0u8; READ_CHUNK];

        // Frontend reads continue concurrently with the backend handshake:
        // the ready-flip happens on AuthenticationOk (§4.5), before the
        // backend driver detaches on ReadyForQuery (§4.6); frames arriving
        // in between are forwarded directly rather than re-buffered.
        'handshake: loop {
            tokio::select! {
                read_res = self.stream.read(&mut fe_chunk) => {
                    let n = read_res?;
                    if n == 0 {
                        return Ok(());
                    }
                    frontend_inbox.extend_from_slice(&fe_chunk[..n]);

                    while let Some(frame) = match frontend_splitter.split(&mut frontend_inbox) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(error = %e, "invalid PG frontend frame");
                            self.fail_to_client(&mut session, &mut guard, "invalid frame").await?;
                            return Ok(());
                        }
                    } {
                        let outcome = match frontend_state.handle_frame(&frame, &mut session, &mut logger) {
                            Ok(o) => o,
                            Err(e) => {
                                warn!(error = %e, "unparseable PG frontend message");
                                self.fail_to_client(&mut session, &mut guard, "invalid frame").await?;
                                return Ok(());
                            }
                        };

                        if let Some(event) = &outcome.query_event {
                            self.audit.on_query(&session, event);
                        }
                        for reply in &outcome.reply_to_client {
                            self.stream.write_all(reply).await?;
                        }
                        if let Some(fwd) = &outcome.forward_to_backend {
                            backend.write_all(fwd).await?;
                        }
                        if outcome.close {
                            return Ok(());
                        }
                    }
                }

                read_res = backend.read(&mut be_chunk) => {
                    let n = read_res?;
                    if n == 0 {
                        self.fail_to_client(&mut session, &mut guard, "Backend connection failed").await?;
                        return Ok(());
                    }
                    backend_inbox.extend_from_slice(&be_chunk[..n]);

                    while let Some(frame) = match backend_splitter.split(&mut backend_inbox) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(error = %e, "invalid PG backend frame during handshake");
                            self.fail_to_client(&mut session, &mut guard, "invalid frame").await?;
                            return Ok(());
                        }
                    } {
                        // Audit observer sees every backend frame zero-copy;
                        // never mutates or drops it (§4.8). C/E frames are
                        // not expected before ReadyForQuery, but the observer
                        // runs unconditionally per the spec's pipeline order.
                        if let Some(result) = audit_observer::observe(&frame) {
                            self.audit.on_result(&session, &result);
                        }

                        let events = match handshake.step(&frame) {
                            Ok(events) => events,
                            Err(e) => {
                                warn!(error = %e, "backend handshake parse error");
                                self.fail_to_client(&mut session, &mut guard, "authentication failed").await?;
                                return Ok(());
                            }
                        };

                        for event in events {
                            match event {
                                HandshakeEvent::ForwardToFrontend(bytes) => {
                                    self.stream.write_all(&bytes).await?;
                                }
                                HandshakeEvent::SynthesizeAuthOk => {
                                    self.stream.write_all(&message::authentication_ok()).await?;

                                    if guard.mark_started() {
                                        self.audit.on_session_start(&session, None);
                                    }

                                    for pending in frontend_state.mark_ready() {
                                        backend.write_all(&pending).await?;
                                    }
                                }
                                HandshakeEvent::NeedInitialGssToken => {
                                    let route2 = route.clone();
                                    let (authenticator, token) =
                                        tokio::task::spawn_blocking(move || -> Result<_, String> {
                                            let mut g = GssAuthenticator::login(&route2)
                                                .map_err(|e| e.to_string())?;
                                            let token = g.initial_token().map_err(|e| e.to_string())?;
                                            Ok((g, token))
                                        })
                                        .await
                                        .map_err(|e| std::io::Error::other(e.to_string()))?
                                        .map_err(std::io::Error::other)?;
                                    gss = Some(authenticator);
                                    backend.write_all(&backend::encode_gss_token(&token)).await?;
                                }
                                HandshakeEvent::NeedGssContinuation { server_token } => {
                                    let mut authenticator = gss.take().ok_or_else(|| {
                                        std::io::Error::other("GSS continuation without a context")
                                    })?;
                                    let (authenticator, token) = tokio::task::spawn_blocking(move || {
                                        let t = authenticator.challenge(&server_token);
                                        (authenticator, t)
                                    })
                                    .await
                                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                                    gss = Some(authenticator);
                                    let token = token.map_err(std::io::Error::other)?;
                                    backend.write_all(&backend::encode_gss_token(&token)).await?;
                                }
                                HandshakeEvent::Ready => {
                                    info!("PG backend handshake complete");
                                    break 'handshake;
                                }
                            }
                        }
                    }
                }
            }
        }

        // Past Ready, the frontend Query logger and backend audit observer
        // are done: per §4.5/§4.6, ReadyForQuery installs a plain
        // bidirectional pump and nothing downstream inspects frames again.
        // Any bytes already buffered past the last whole frame go first.
        if !frontend_inbox.is_empty() {
            backend.write_all(&frontend_inbox).await?;
        }
        if !backend_inbox.is_empty() {
            self.stream.write_all(&backend_inbox).await?;
        }

        let _ = pump::link(&mut self.stream, &mut backend).await;

        if guard.mark_ended() {
            self.audit.on_session_end(&session);
        }

        Ok(())
    }
}
