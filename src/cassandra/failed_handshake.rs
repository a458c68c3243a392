//! Failed-Handshake Responder (§4.12). Installed on the frontend pipeline
//! when the backend is unreachable or dial failed before READY. Drives the
//! client through exactly one canonical handshake turn locally, then closes.

use bytes::Bytes;

use crate::cassandra::message::{self, FrameHeader};

/// One step of the canonical SUPPORTED -> AUTHENTICATE -> AUTH_ERROR reply.
/// All replies are legacy (non-segmented) frames carrying the client's
/// negotiated version and echoing stream-id.
#[derive(Debug, Default)]
pub struct FailedHandshakeOutcome {
    pub reply_to_client: Option<Bytes>,
    pub close_on_flush: bool,
}

pub struct FailedHandshakeResponder {
    auth_error_message: String,
}

impl FailedHandshakeResponder {
    pub fn new(auth_error_message: impl Into<String>) -> Self {
        Self {
            auth_error_message: auth_error_message.into(),
        }
    }

    /// Handle one whole client frame. Anything other than the three
    /// recognized opcodes is ignored (there is no backend to misbehave
    /// against, and the client only ever drives this one turn).
    pub fn on_client_frame(&self, raw: &[u8]) -> Option<FailedHandshakeOutcome> {
        let header = FrameHeader::parse(raw)?;

        match header.opcode {
            message::OP_OPTIONS => Some(FailedHandshakeOutcome {
                reply_to_client: Some(message::encode_supported(
                    header.version,
                    header.stream_id,
                    &[("CQL_VERSION", &["3.4.5"]), ("COMPRESSION", &[])],
                )),
                close_on_flush: false,
            }),
            message::OP_STARTUP => Some(FailedHandshakeOutcome {
                reply_to_client: Some(message::encode_authenticate(
                    header.version,
                    header.stream_id,
                    message::PASSWORD_AUTHENTICATOR_CLASS,
                )),
                close_on_flush: false,
            }),
            message::OP_AUTH_RESPONSE => Some(FailedHandshakeOutcome {
                reply_to_client: Some(message::encode_error(
                    header.version,
                    header.stream_id,
                    message::AUTH_ERROR_CODE,
                    &self.auth_error_message,
                )),
                close_on_flush: true,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn frame(version: u8, stream_id: i16, opcode: u8, body: &[u8]) -> BytesMut {
        let mut f = BytesMut::new();
        f.put_u8(version);
        f.put_u8(0);
        f.put_i16(stream_id);
        f.put_u8(opcode);
        f.put_u32(body.len() as u32);
        f.extend_from_slice(body);
        f
    }

    #[test]
    fn options_replies_supported() {
        let responder = FailedHandshakeResponder::new("backend unavailable");
        let outcome = responder
            .on_client_frame(&frame(4, 0, message::OP_OPTIONS, &[]))
            .expect("outcome");
        let reply = outcome.reply_to_client.expect("reply");
        let header = FrameHeader::parse(&reply).unwrap();
        assert_eq!(header.opcode, message::OP_SUPPORTED);
        assert_eq!(header.stream_id, 0);
        assert!(!outcome.close_on_flush);
    }

    #[test]
    fn startup_replies_authenticate_with_password_authenticator() {
        let responder = FailedHandshakeResponder::new("backend unavailable");
        let outcome = responder
            .on_client_frame(&frame(4, 1, message::OP_STARTUP, &[]))
            .expect("outcome");
        let reply = outcome.reply_to_client.expect("reply");
        let header = FrameHeader::parse(&reply).unwrap();
        assert_eq!(header.opcode, message::OP_AUTHENTICATE);
        assert_eq!(header.stream_id, 1);
    }

    #[test]
    fn auth_response_replies_auth_error_and_closes() {
        let responder = FailedHandshakeResponder::new("cannot reach backend");
        let outcome = responder
            .on_client_frame(&frame(4, 2, message::OP_AUTH_RESPONSE, &[]))
            .expect("outcome");
        let reply = outcome.reply_to_client.expect("reply");
        let header = FrameHeader::parse(&reply).unwrap();
        assert_eq!(header.opcode, message::OP_ERROR);
        let body = FrameHeader::body(&reply);
        let code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        assert_eq!(code, message::AUTH_ERROR_CODE);
        assert!(outcome.close_on_flush);
    }

    #[test]
    fn echoes_client_stream_id_and_negotiated_version() {
        let responder = FailedHandshakeResponder::new("x");
        let outcome = responder
            .on_client_frame(&frame(5, 99, message::OP_OPTIONS, &[]))
            .unwrap();
        let reply = outcome.reply_to_client.unwrap();
        let header = FrameHeader::parse(&reply).unwrap();
        assert_eq!(header.version, 5);
        assert_eq!(header.stream_id, 99);
    }
}
