//! PG Backend Handshake Driver (§4.6). Drives `AuthenticationGSS` /
//! `GSSContinue` to completion, then hands off to the plain backend pump on
//! `ReadyForQuery`. GSS token generation is treated as a blocking operation
//! by the caller (§5); this module only decides *what* to do with each
//! backend frame, never performs I/O itself, so it can be unit-tested
//! without sockets or a real Kerberos environment.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::route::Route;

const AUTH_OK: u32 = 0;
const AUTH_GSS: u32 = 7;
const AUTH_GSS_CONTINUE: u32 = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("frame too short")]
    TooShort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Forward this whole frame verbatim to the frontend.
    ForwardToFrontend(Bytes),
    /// Synthesize `AuthenticationOk` and send it to the frontend now.
    SynthesizeAuthOk,
    /// No server token yet: generate the initial GSS token and send it to
    /// the backend as a `PasswordMessage`.
    NeedInitialGssToken,
    /// Feed `server_token` to the GSS context and send the continuation as
    /// a `PasswordMessage`.
    NeedGssContinuation { server_token: Vec<u8> },
    /// `ReadyForQuery` observed with auth-ok already latched: detach the
    /// driver and install the plain backend pump.
    Ready,
}

/// Build the StartupMessage the driver sends on backend channel-active:
/// `user=<route.backend_user>` and `database=<route.backend_database or "">`.
pub fn build_startup_message(route: &Route) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(196_608); // protocol 3.0

    body.extend_from_slice(b"user");
    body.put_u8(0);
    body.extend_from_slice(route.backend_user.as_bytes());
    body.put_u8(0);

    body.extend_from_slice(b"database");
    body.put_u8(0);
    body.extend_from_slice(route.backend_database.as_bytes());
    body.put_u8(0);

    body.put_u8(0); // terminator

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32((4 + body.len()) as u32);
    frame.extend_from_slice(&body);
    frame.freeze()
}

/// Wrap a GSS token as a `PasswordMessage` (`p`) frame.
pub fn encode_gss_token(token: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + token.len());
    buf.put_u8(b'p');
    buf.put_u32((4 + token.len()) as u32);
    buf.extend_from_slice(token);
    buf.freeze()
}

#[derive(Debug, Default)]
pub struct BackendHandshake {
    auth_ok: bool,
}

impl BackendHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auth_ok(&self) -> bool {
        self.auth_ok
    }

    /// Process one whole backend frame (tag + 4-byte length + payload).
    pub fn step(&mut self, frame: &[u8]) -> Result<Vec<HandshakeEvent>, HandshakeError> {
        if frame.is_empty() {
            return Err(HandshakeError::TooShort);
        }
        let tag = frame[0];

        match tag {
            b'R' => self.on_authentication(frame),
            b'S' | b'K' => Ok(vec![HandshakeEvent::ForwardToFrontend(Bytes::copy_from_slice(frame))]),
            b'Z' => {
                let mut events = vec![HandshakeEvent::ForwardToFrontend(Bytes::copy_from_slice(frame))];
                if self.auth_ok {
                    events.push(HandshakeEvent::Ready);
                }
                Ok(events)
            }
            _ => Ok(vec![HandshakeEvent::ForwardToFrontend(Bytes::copy_from_slice(frame))]),
        }
    }

    fn on_authentication(&mut self, frame: &[u8]) -> Result<Vec<HandshakeEvent>, HandshakeError> {
        if frame.len() < 9 {
            return Err(HandshakeError::TooShort);
        }
        let code = u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]);

        match code {
            AUTH_GSS => Ok(vec![HandshakeEvent::NeedInitialGssToken]),
            AUTH_GSS_CONTINUE => {
                let server_token = frame[9..].to_vec();
                Ok(vec![HandshakeEvent::NeedGssContinuation { server_token }])
            }
            AUTH_OK => {
                self.auth_ok = true;
                Ok(vec![HandshakeEvent::SynthesizeAuthOk])
            }
            _ => Ok(vec![HandshakeEvent::ForwardToFrontend(Bytes::copy_from_slice(frame))]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_frame(code: u32, extra: &[u8]) -> BytesMut {
        let mut frame = BytesMut::new();
        frame.put_u8(b'R');
        frame.put_u32((8 + extra.len()) as u32);
        frame.put_u32(code);
        frame.extend_from_slice(extra);
        frame
    }

    #[test]
    fn gss_request_asks_for_initial_token() {
        let mut hs = BackendHandshake::new();
        let events = hs.step(&auth_frame(7, &[])).unwrap();
        assert_eq!(events, vec![HandshakeEvent::NeedInitialGssToken]);
    }

    #[test]
    fn gss_continue_carries_server_token() {
        let mut hs = BackendHandshake::new();
        let events = hs.step(&auth_frame(8, b"servertoken")).unwrap();
        assert_eq!(
            events,
            vec![HandshakeEvent::NeedGssContinuation {
                server_token: b"servertoken".to_vec()
            }]
        );
    }

    #[test]
    fn auth_ok_latches_and_synthesizes() {
        let mut hs = BackendHandshake::new();
        let events = hs.step(&auth_frame(0, &[])).unwrap();
        assert_eq!(events, vec![HandshakeEvent::SynthesizeAuthOk]);
        assert!(hs.auth_ok());
    }

    #[test]
    fn ready_for_query_completes_handshake_only_after_auth_ok() {
        let mut hs = BackendHandshake::new();
        let mut z = BytesMut::new();
        z.put_u8(b'Z');
        z.put_u32(5);
        z.put_u8(b'I');

        let events = hs.step(&z).unwrap();
        assert_eq!(events.len(), 1); // no AuthOk yet: not ready

        hs.step(&auth_frame(0, &[])).unwrap();
        let events = hs.step(&z).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], HandshakeEvent::Ready);
    }

    #[test]
    fn startup_message_carries_route_user_and_database() {
        let route = Route {
            host: "h".into(),
            port: 5432,
            backend_user: "alice".into(),
            backend_database: "sales".into(),
            ca_path: None,
            server_name: None,
            krb5_config_path: None,
            ticket_cache_path: None,
            client_principal: None,
            service_principal: "postgres/h".into(),
            expected_username: None,
        };
        let frame = build_startup_message(&route);
        assert!(frame.windows(5).any(|w| w == b"user\0"));
        assert!(frame.windows(6).any(|w| w == b"alice\0"));
    }
}
