//! PG Message Parser/Encoder (§4.4). Decodes frontend messages into tagged
//! variants; encodes the handful of replies the proxy synthesizes itself.

use bytes::{BufMut, Bytes, BytesMut};
use memchr::memchr;
use thiserror::Error;

pub(crate) const CODE_SSL_REQUEST: u32 = 80_877_103;
pub(crate) const CODE_GSSENC_REQUEST: u32 = 80_877_104;
pub(crate) const CODE_CANCEL_REQUEST: u32 = 80_877_102;
const CODE_PROTOCOL_3_0: u32 = 196_608;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("frame too short")]
    TooShort,
    #[error("unterminated cstring")]
    UnterminatedCstring,
    #[error("startup message is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown startup code {0}")]
    UnknownStartupCode(u32),
}

/// Tagged frontend message variants (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    SslRequest,
    GssEncRequest,
    CancelRequest { pid: i32, secret: i32 },
    StartupMessage {
        major: u16,
        minor: u16,
        /// Ordered name/value pairs, wire order preserved (§3 "ordered
        /// mapping"); a client sending the same key twice is not deduped.
        params: Vec<(String, String)>,
    },
    Query(String),
    Parse { statement_name: String, sql: String },
    Bind { portal: String, statement: String, parameter_count: u16 },
    Execute { portal: String, max_rows: i32 },
    Describe { target_kind: u8, name: String },
    Close { target_kind: u8, name: String },
    Sync,
    Flush,
    CopyData(Bytes),
    CopyDone,
    CopyFail(String),
    FunctionCall { arg_count: u16 },
    PasswordMessage(Bytes),
    Terminate,
    Unknown { tag: u8 },
}

/// Read a NUL-terminated UTF-8 string from the front of `bytes`, advancing
/// past the terminator. An immediate terminator yields an empty string.
fn read_cstr<'a>(bytes: &mut &'a [u8]) -> Result<&'a str, MessageError> {
    let idx = memchr(0, bytes).ok_or(MessageError::UnterminatedCstring)?;
    let (before, after) = bytes.split_at(idx);
    *bytes = &after[1..];
    std::str::from_utf8(before).map_err(|_| MessageError::InvalidUtf8)
}

fn parse_startup_params(mut rest: &[u8]) -> Result<Vec<(String, String)>, MessageError> {
    let mut params = Vec::new();
    loop {
        if rest.is_empty() {
            return Err(MessageError::TooShort);
        }
        let name = read_cstr(&mut rest)?;
        if name.is_empty() {
            break;
        }
        let value = read_cstr(&mut rest)?;
        params.push((name.to_string(), value.to_string()));
    }
    Ok(params)
}

/// Parse a whole frame as produced by `FrameSplitter`. `in_startup` selects
/// the startup-frame shape (no type byte) vs. the typed-frame shape.
pub fn parse_frontend(frame: &[u8], in_startup: bool) -> Result<FrontendMessage, MessageError> {
    if in_startup {
        return parse_startup_frame(frame);
    }
    parse_typed_frame(frame)
}

fn parse_startup_frame(frame: &[u8]) -> Result<FrontendMessage, MessageError> {
    if frame.len() < 8 {
        return Err(MessageError::TooShort);
    }
    let code = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
    match code {
        CODE_SSL_REQUEST => Ok(FrontendMessage::SslRequest),
        CODE_GSSENC_REQUEST => Ok(FrontendMessage::GssEncRequest),
        CODE_CANCEL_REQUEST => {
            if frame.len() < 16 {
                return Err(MessageError::TooShort);
            }
            let pid = i32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]);
            let secret = i32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]);
            Ok(FrontendMessage::CancelRequest { pid, secret })
        }
        CODE_PROTOCOL_3_0 => {
            let major = (code >> 16) as u16;
            let minor = (code & 0xFFFF) as u16;
            let params = parse_startup_params(&frame[8..])?;
            Ok(FrontendMessage::StartupMessage { major, minor, params })
        }
        other if (other >> 16) != 0 => {
            // Any other protocol-version-looking code: parse params the same way.
            let major = (other >> 16) as u16;
            let minor = (other & 0xFFFF) as u16;
            let params = parse_startup_params(&frame[8..])?;
            Ok(FrontendMessage::StartupMessage { major, minor, params })
        }
        other => Err(MessageError::UnknownStartupCode(other)),
    }
}

fn parse_typed_frame(frame: &[u8]) -> Result<FrontendMessage, MessageError> {
    if frame.len() < 5 {
        return Err(MessageError::TooShort);
    }
    let tag = frame[0];
    let mut body = &frame[5..];

    Ok(match tag {
        b'Q' => FrontendMessage::Query(read_cstr(&mut body)?.to_string()),
        b'P' => {
            let statement_name = read_cstr(&mut body)?.to_string();
            let sql = read_cstr(&mut body)?.to_string();
            FrontendMessage::Parse { statement_name, sql }
        }
        b'B' => parse_bind(body)?,
        b'E' => {
            let portal = read_cstr(&mut body)?.to_string();
            if body.len() < 4 {
                return Err(MessageError::TooShort);
            }
            let max_rows = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            FrontendMessage::Execute { portal, max_rows }
        }
        b'D' => {
            if body.is_empty() {
                return Err(MessageError::TooShort);
            }
            let target_kind = body[0];
            body = &body[1..];
            let name = read_cstr(&mut body)?.to_string();
            FrontendMessage::Describe { target_kind, name }
        }
        b'C' => {
            if body.is_empty() {
                return Err(MessageError::TooShort);
            }
            let target_kind = body[0];
            body = &body[1..];
            let name = read_cstr(&mut body)?.to_string();
            FrontendMessage::Close { target_kind, name }
        }
        b'S' => FrontendMessage::Sync,
        b'H' => FrontendMessage::Flush,
        b'd' => FrontendMessage::CopyData(Bytes::copy_from_slice(body)),
        b'c' => FrontendMessage::CopyDone,
        b'f' => FrontendMessage::CopyFail(read_cstr(&mut body)?.to_string()),
        b'F' => {
            if body.len() < 2 {
                return Err(MessageError::TooShort);
            }
            let arg_count = u16::from_be_bytes([body[0], body[1]]);
            FrontendMessage::FunctionCall { arg_count }
        }
        b'p' => FrontendMessage::PasswordMessage(Bytes::copy_from_slice(body)),
        b'X' => FrontendMessage::Terminate,
        other => FrontendMessage::Unknown { tag: other },
    })
}

/// Skip the Bind payload's format-code and parameter arrays by advertised
/// counts, using 4-byte lengths per parameter (-1 = NULL), without decoding
/// parameter values themselves (§4.4).
fn parse_bind(mut body: &[u8]) -> Result<FrontendMessage, MessageError> {
    let portal = read_cstr(&mut body)?.to_string();
    let statement = read_cstr(&mut body)?.to_string();

    if body.len() < 2 {
        return Err(MessageError::TooShort);
    }
    let format_code_count = u16::from_be_bytes([body[0], body[1]]) as usize;
    body = &body[2..];
    let skip = format_code_count.checked_mul(2).ok_or(MessageError::TooShort)?;
    if body.len() < skip {
        return Err(MessageError::TooShort);
    }
    body = &body[skip..];

    if body.len() < 2 {
        return Err(MessageError::TooShort);
    }
    let parameter_count = u16::from_be_bytes([body[0], body[1]]);
    body = &body[2..];

    for _ in 0..parameter_count {
        if body.len() < 4 {
            return Err(MessageError::TooShort);
        }
        let len = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        body = &body[4..];
        if len >= 0 {
            let len = len as usize;
            if body.len() < len {
                return Err(MessageError::TooShort);
            }
            body = &body[len..];
        }
        // len == -1 (NULL): nothing further to skip for this parameter.
    }

    // Result-format-code array is trailing and not needed for audit; the
    // caller only needs to know how many bytes of the frame Bind consumed,
    // which the outer frame boundary already guarantees.
    let _ = body;

    Ok(FrontendMessage::Bind {
        portal,
        statement,
        parameter_count,
    })
}

// -----------------------------------------------------------------------------
// ----- Encoders ----------------------------------------------------------------

/// `Q` + u32 length + UTF-8 bytes + NUL.
pub fn encode_query(sql: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + sql.len() + 1);
    buf.put_u8(b'Q');
    let len = (4 + sql.len() + 1) as u32;
    buf.put_u32(len);
    buf.extend_from_slice(sql.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

/// `R` + length(4). The reference encoder emits a length of 0, which is a
/// documented bug (§9 Open Question: "the length field includes itself");
/// this implementation emits the standard-compliant length of 4.
pub fn authentication_ok() -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(b'R');
    buf.put_u32(4);
    buf.freeze()
}

/// `R` + length(8) + code(3) (AuthenticationCleartextPassword).
pub fn authentication_cleartext() -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(b'R');
    buf.put_u32(8);
    buf.put_u32(3);
    buf.freeze()
}

/// A single byte `N`: the PG SSL-negotiation "not supported" reply. No
/// length framing; this is the one PG reply that is not a typed frame.
pub fn ssl_not_supported() -> Bytes {
    Bytes::from_static(b"N")
}

/// `E` + length + field `M` + message + NUL + terminator NUL.
pub fn error_response(message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + message.len());
    buf.put_u8(b'E');
    buf.put_u32(0); // patched below
    buf.put_u8(b'M');
    buf.extend_from_slice(message.as_bytes());
    buf.put_u8(0);
    buf.put_u8(0);
    let len = (buf.len() - 1) as u32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn startup_frame(major: u16, minor: u16, params: &[(&str, &str)]) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u16(major);
        body.put_u16(minor);
        for (k, v) in params {
            body.extend_from_slice(k.as_bytes());
            body.put_u8(0);
            body.extend_from_slice(v.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0);

        let mut frame = BytesMut::new();
        frame.put_u32((4 + body.len()) as u32);
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn parses_startup_message_params() {
        let frame = startup_frame(3, 0, &[("user", "alice"), ("database", "sales")]);
        let msg = parse_frontend(&frame, true).unwrap();
        match msg {
            FrontendMessage::StartupMessage { major, minor, params } => {
                assert_eq!((major, minor), (3, 0));
                assert_eq!(
                    params,
                    vec![
                        ("user".to_string(), "alice".to_string()),
                        ("database".to_string(), "sales".to_string()),
                    ]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn startup_message_params_preserve_wire_order() {
        let frame = startup_frame(3, 0, &[("zebra", "1"), ("apple", "2"), ("user", "alice")]);
        let msg = parse_frontend(&frame, true).unwrap();
        match msg {
            FrontendMessage::StartupMessage { params, .. } => {
                assert_eq!(
                    params,
                    vec![
                        ("zebra".to_string(), "1".to_string()),
                        ("apple".to_string(), "2".to_string()),
                        ("user".to_string(), "alice".to_string()),
                    ],
                    "wire order must not be re-sorted alphabetically"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_ssl_request() {
        let mut frame = BytesMut::new();
        frame.put_u32(8);
        frame.put_u32(CODE_SSL_REQUEST);
        assert_eq!(parse_frontend(&frame, true).unwrap(), FrontendMessage::SslRequest);
    }

    #[test]
    fn parses_cancel_request() {
        let mut frame = BytesMut::new();
        frame.put_u32(16);
        frame.put_u32(CODE_CANCEL_REQUEST);
        frame.put_i32(4242);
        frame.put_i32(99);
        assert_eq!(
            parse_frontend(&frame, true).unwrap(),
            FrontendMessage::CancelRequest { pid: 4242, secret: 99 }
        );
    }

    #[test]
    fn parses_query() {
        let mut frame = BytesMut::new();
        let sql = "SELECT 1";
        frame.put_u8(b'Q');
        frame.put_u32((4 + sql.len() + 1) as u32);
        frame.extend_from_slice(sql.as_bytes());
        frame.put_u8(0);

        assert_eq!(
            parse_frontend(&frame, false).unwrap(),
            FrontendMessage::Query(sql.to_string())
        );
    }

    #[test]
    fn bind_skips_parameters_by_advertised_length() {
        let mut body = BytesMut::new();
        body.extend_from_slice(b"portal1\0");
        body.extend_from_slice(b"stmt1\0");
        body.put_u16(0); // zero format codes
        body.put_u16(2); // two parameters
        body.put_i32(4); // param 1: 4 bytes
        body.extend_from_slice(b"1234");
        body.put_i32(-1); // param 2: NULL
        body.put_u16(0); // zero result format codes

        let mut frame = BytesMut::new();
        frame.put_u8(b'B');
        frame.put_u32((4 + body.len()) as u32);
        frame.extend_from_slice(&body);

        let msg = parse_frontend(&frame, false).unwrap();
        assert_eq!(
            msg,
            FrontendMessage::Bind {
                portal: "portal1".into(),
                statement: "stmt1".into(),
                parameter_count: 2,
            }
        );
    }

    #[test]
    fn password_message_is_opaque() {
        let mut frame = BytesMut::new();
        frame.put_u8(b'p');
        frame.put_u32(9);
        frame.extend_from_slice(b"whatever");
        assert_eq!(
            parse_frontend(&frame, false).unwrap(),
            FrontendMessage::PasswordMessage(Bytes::from_static(b"whatever"))
        );
    }

    #[test]
    fn unknown_tag_preserves_byte() {
        let mut frame = BytesMut::new();
        frame.put_u8(b'~');
        frame.put_u32(4);
        assert_eq!(
            parse_frontend(&frame, false).unwrap(),
            FrontendMessage::Unknown { tag: b'~' }
        );
    }

    #[test]
    fn query_round_trips_through_encode_and_parse() {
        let sql = "select * from t where x = 'quoted ''value'''";
        let encoded = encode_query(sql);
        let parsed = parse_frontend(&encoded, false).unwrap();
        assert_eq!(parsed, FrontendMessage::Query(sql.to_string()));
        assert_eq!(encode_query(sql), encoded);
    }

    #[test]
    fn authentication_ok_uses_standard_compliant_length() {
        let bytes = authentication_ok();
        assert_eq!(&bytes[0..1], b"R");
        assert_eq!(bytes.len(), 5);
        assert_eq!(u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]), 4);
    }

    #[test]
    fn ssl_not_supported_is_a_single_byte() {
        assert_eq!(ssl_not_supported(), Bytes::from_static(b"N"));
    }

    #[test]
    fn error_response_carries_message_field() {
        let bytes = error_response("backend connection failed");
        assert_eq!(bytes[0], b'E');
        assert!(bytes.windows(27).any(|w| w == b"Mbackend connection failed\0"));
    }
}
