//! Cassandra Message Parser (§4.10). Header, STARTUP options, AUTH_RESPONSE
//! (including the `PasswordAuthenticator` wire layout), QUERY/PREPARE/
//! EXECUTE/BATCH/REGISTER audit projection, AUTHENTICATE, and the frame
//! encoders the proxy needs to speak back to the client (SUPPORTED,
//! AUTHENTICATE, ERROR) and to the backend (AUTH_RESPONSE).

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::util::hex_encode;

// -----------------------------------------------------------------------------
// ----- Opcodes (§6.2) ------------------------------------------------------------

pub const OP_ERROR: u8 = 0x00;
pub const OP_STARTUP: u8 = 0x01;
pub const OP_READY: u8 = 0x02;
pub const OP_AUTHENTICATE: u8 = 0x03;
pub const OP_OPTIONS: u8 = 0x05;
pub const OP_SUPPORTED: u8 = 0x06;
pub const OP_QUERY: u8 = 0x07;
pub const OP_PREPARE: u8 = 0x09;
pub const OP_EXECUTE: u8 = 0x0A;
pub const OP_REGISTER: u8 = 0x0B;
pub const OP_BATCH: u8 = 0x0D;
pub const OP_AUTH_CHALLENGE: u8 = 0x0E;
pub const OP_AUTH_RESPONSE: u8 = 0x0F;
pub const OP_AUTH_SUCCESS: u8 = 0x10;

pub const AUTH_ERROR_CODE: i32 = 0x0100;
pub const PASSWORD_AUTHENTICATOR_CLASS: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("frame too short")]
    TooShort,
    #[error("invalid utf8 in string field")]
    InvalidUtf8,
}

// -----------------------------------------------------------------------------
// ----- Header (§3) ---------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub version: u8,
    pub is_response: bool,
    pub flags: u8,
    pub stream_id: i16,
    pub opcode: u8,
    pub body_len: u32,
}

impl FrameHeader {
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < 9 {
            return None;
        }
        Some(Self {
            version: frame[0] & 0x7F,
            is_response: frame[0] & 0x80 != 0,
            flags: frame[1],
            stream_id: i16::from_be_bytes([frame[2], frame[3]]),
            opcode: frame[4],
            body_len: u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]),
        })
    }

    pub fn body(frame: &[u8]) -> &[u8] {
        &frame[9..]
    }
}

// -----------------------------------------------------------------------------
// ----- Primitive readers -----------------------------------------------------

fn read_u16_string(src: &mut &[u8]) -> Result<String, MessageError> {
    if src.len() < 2 {
        return Err(MessageError::TooShort);
    }
    let len = u16::from_be_bytes([src[0], src[1]]) as usize;
    *src = &src[2..];
    if src.len() < len {
        return Err(MessageError::TooShort);
    }
    let (s, rest) = src.split_at(len);
    *src = rest;
    std::str::from_utf8(s).map(str::to_owned).map_err(|_| MessageError::InvalidUtf8)
}

fn read_long_string(src: &mut &[u8]) -> Result<String, MessageError> {
    if src.len() < 4 {
        return Err(MessageError::TooShort);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    *src = &src[4..];
    if src.len() < len {
        return Err(MessageError::TooShort);
    }
    let (s, rest) = src.split_at(len);
    *src = rest;
    std::str::from_utf8(s).map(str::to_owned).map_err(|_| MessageError::InvalidUtf8)
}

fn read_short_bytes(src: &mut &[u8]) -> Result<Vec<u8>, MessageError> {
    if src.len() < 2 {
        return Err(MessageError::TooShort);
    }
    let len = u16::from_be_bytes([src[0], src[1]]) as usize;
    *src = &src[2..];
    if src.len() < len {
        return Err(MessageError::TooShort);
    }
    let (b, rest) = src.split_at(len);
    *src = rest;
    Ok(b.to_vec())
}

/// `bytes`: `[int]` length + data; `-1` means "empty" (§4.10).
fn read_bytes(src: &mut &[u8]) -> Result<Vec<u8>, MessageError> {
    if src.len() < 4 {
        return Err(MessageError::TooShort);
    }
    let len = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
    *src = &src[4..];
    if len < 0 {
        return Ok(Vec::new());
    }
    let len = len as usize;
    if src.len() < len {
        return Err(MessageError::TooShort);
    }
    let (b, rest) = src.split_at(len);
    *src = rest;
    Ok(b.to_vec())
}

fn skip_values(src: &mut &[u8]) -> Result<(), MessageError> {
    if src.len() < 2 {
        return Err(MessageError::TooShort);
    }
    let count = u16::from_be_bytes([src[0], src[1]]) as usize;
    *src = &src[2..];
    for _ in 0..count {
        read_bytes(src)?;
    }
    Ok(())
}

fn write_u16_string(dst: &mut BytesMut, s: &str) {
    dst.put_u16(s.len() as u16);
    dst.extend_from_slice(s.as_bytes());
}

fn write_bytes(dst: &mut BytesMut, data: &[u8]) {
    dst.put_i32(data.len() as i32);
    dst.extend_from_slice(data);
}

// -----------------------------------------------------------------------------
// ----- STARTUP ---------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    pub cql_version: Option<String>,
    pub compression: Option<String>,
    pub driver_name: Option<String>,
    pub driver_version: Option<String>,
}

pub fn parse_startup(body: &[u8]) -> Result<StartupOptions, MessageError> {
    let mut rest = body;
    if rest.len() < 2 {
        return Err(MessageError::TooShort);
    }
    let count = u16::from_be_bytes([rest[0], rest[1]]);
    rest = &rest[2..];

    let mut opts = StartupOptions::default();
    for _ in 0..count {
        let key = read_u16_string(&mut rest)?;
        let value = read_u16_string(&mut rest)?;
        match key.as_str() {
            "CQL_VERSION" => opts.cql_version = Some(value),
            "COMPRESSION" => opts.compression = Some(value),
            "DRIVER_NAME" => opts.driver_name = Some(value),
            "DRIVER_VERSION" => opts.driver_version = Some(value),
            _ => {}
        }
    }
    Ok(opts)
}

// -----------------------------------------------------------------------------
// ----- AUTH_RESPONSE / AUTHENTICATE -------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponseBody {
    Password { username: String, password: Vec<u8> },
    Opaque(Vec<u8>),
}

pub fn parse_auth_response(body: &[u8]) -> Result<AuthResponseBody, MessageError> {
    let mut rest = body;
    let token = read_bytes(&mut rest)?;
    match parse_password_authenticator_layout(&token) {
        Some((username, password)) => Ok(AuthResponseBody::Password { username, password }),
        None => Ok(AuthResponseBody::Opaque(token)),
    }
}

/// `\0<username>\0<password>`.
fn parse_password_authenticator_layout(token: &[u8]) -> Option<(String, Vec<u8>)> {
    if token.first() != Some(&0) {
        return None;
    }
    let rest = &token[1..];
    let sep = memchr::memchr(0, rest)?;
    let username = std::str::from_utf8(&rest[..sep]).ok()?.to_string();
    let password = rest[sep + 1..].to_vec();
    Some((username, password))
}

pub fn parse_authenticate(body: &[u8]) -> Result<String, MessageError> {
    let mut rest = body;
    read_u16_string(&mut rest)
}

pub fn parse_auth_challenge(body: &[u8]) -> Result<Vec<u8>, MessageError> {
    let mut rest = body;
    read_bytes(&mut rest)
}

// -----------------------------------------------------------------------------
// ----- Audit-relevant bodies ---------------------------------------------------

pub fn parse_query(body: &[u8]) -> Result<String, MessageError> {
    let mut rest = body;
    read_long_string(&mut rest)
}

pub fn parse_prepare(body: &[u8]) -> Result<String, MessageError> {
    parse_query(body)
}

pub fn parse_execute(body: &[u8]) -> Result<Vec<u8>, MessageError> {
    let mut rest = body;
    read_short_bytes(&mut rest)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatement {
    /// `Some` when the statement carries its own query text; `None` when it
    /// references a prepared id instead.
    pub text: Option<String>,
}

pub fn parse_batch(body: &[u8]) -> Result<Vec<BatchStatement>, MessageError> {
    let mut rest = body;
    if rest.is_empty() {
        return Err(MessageError::TooShort);
    }
    rest = &rest[1..]; // batch-type byte, not needed for audit
    if rest.len() < 2 {
        return Err(MessageError::TooShort);
    }
    let count = u16::from_be_bytes([rest[0], rest[1]]);
    rest = &rest[2..];

    let mut statements = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if rest.is_empty() {
            return Err(MessageError::TooShort);
        }
        let kind = rest[0];
        rest = &rest[1..];
        let text = if kind == 0 {
            Some(read_long_string(&mut rest)?)
        } else {
            read_short_bytes(&mut rest)?;
            None
        };
        skip_values(&mut rest)?;
        statements.push(BatchStatement { text });
    }
    Ok(statements)
}

pub fn parse_register(body: &[u8]) -> Result<Vec<String>, MessageError> {
    let mut rest = body;
    if rest.len() < 2 {
        return Err(MessageError::TooShort);
    }
    let count = u16::from_be_bytes([rest[0], rest[1]]);
    rest = &rest[2..];

    let mut events = Vec::with_capacity(count as usize);
    for _ in 0..count {
        events.push(read_u16_string(&mut rest)?);
    }
    Ok(events)
}

/// Projects QUERY/PREPARE/EXECUTE/BATCH/REGISTER into a textual detail
/// suitable for the audit recorder's query payload.
pub fn audit_detail(opcode: u8, body: &[u8]) -> Option<String> {
    match opcode {
        OP_QUERY => parse_query(body).ok(),
        OP_PREPARE => parse_prepare(body).ok().map(|s| format!("PREPARE {s}")),
        OP_EXECUTE => parse_execute(body).ok().map(|id| format!("EXECUTE {}", hex_encode(&id))),
        OP_BATCH => parse_batch(body).ok().map(|stmts| {
            let texts: Vec<String> = stmts
                .iter()
                .map(|s| s.text.clone().unwrap_or_else(|| "<prepared>".to_string()))
                .collect();
            format!("BATCH [{}]", texts.join("; "))
        }),
        OP_REGISTER => parse_register(body).ok().map(|events| format!("REGISTER {}", events.join(","))),
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// ----- Encoders ----------------------------------------------------------------

/// `response = true` sets the high bit of the version byte (proxy acting as
/// server, e.g. replying to the client); `false` leaves it clear (proxy
/// acting as client, e.g. the GSS AUTH_RESPONSE it sends to the backend).
fn encode_frame(version: u8, response: bool, flags: u8, stream_id: i16, opcode: u8, body: &[u8]) -> Bytes {
    let version_byte = if response { version | 0x80 } else { version & 0x7F };
    let mut buf = BytesMut::with_capacity(9 + body.len());
    buf.put_u8(version_byte);
    buf.put_u8(flags);
    buf.put_i16(stream_id);
    buf.put_u8(opcode);
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(body);
    buf.freeze()
}

pub fn encode_supported(version: u8, stream_id: i16, options: &[(&str, &[&str])]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(options.len() as u16);
    for (key, values) in options {
        write_u16_string(&mut body, key);
        body.put_u16(values.len() as u16);
        for v in *values {
            write_u16_string(&mut body, v);
        }
    }
    encode_frame(version, true, 0, stream_id, OP_SUPPORTED, &body)
}

pub fn encode_authenticate(version: u8, stream_id: i16, authenticator_class: &str) -> Bytes {
    let mut body = BytesMut::new();
    write_u16_string(&mut body, authenticator_class);
    encode_frame(version, true, 0, stream_id, OP_AUTHENTICATE, &body)
}

pub fn encode_error(version: u8, stream_id: i16, code: i32, message: &str) -> Bytes {
    let mut body = BytesMut::new();
    body.put_i32(code);
    write_u16_string(&mut body, message);
    encode_frame(version, true, 0, stream_id, OP_ERROR, &body)
}

/// Proxy-side AUTH_RESPONSE encoding (§4.11): client-direction header,
/// stream-id copied from the triggering backend frame.
pub fn encode_auth_response(version: u8, stream_id: i16, token: &[u8]) -> Bytes {
    let mut body = BytesMut::new();
    write_bytes(&mut body, token);
    encode_frame(version, false, 0, stream_id, OP_AUTH_RESPONSE, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn startup_body(pairs: &[(&str, &str)]) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u16(pairs.len() as u16);
        for (k, v) in pairs {
            write_u16_string(&mut body, k);
            write_u16_string(&mut body, v);
        }
        body
    }

    #[test]
    fn startup_options_parse_known_keys() {
        let body = startup_body(&[
            ("CQL_VERSION", "3.4.5"),
            ("COMPRESSION", "lz4"),
            ("DRIVER_NAME", "java-driver"),
            ("DRIVER_VERSION", "4.17"),
        ]);
        let opts = parse_startup(&body).unwrap();
        assert_eq!(opts.cql_version.as_deref(), Some("3.4.5"));
        assert_eq!(opts.compression.as_deref(), Some("lz4"));
        assert_eq!(opts.driver_name.as_deref(), Some("java-driver"));
        assert_eq!(opts.driver_version.as_deref(), Some("4.17"));
    }

    #[test]
    fn password_authenticator_layout_is_parsed() {
        let mut token = BytesMut::new();
        token.put_u8(0);
        token.extend_from_slice(b"alice");
        token.put_u8(0);
        token.extend_from_slice(b"s3cret");

        let mut body = BytesMut::new();
        write_bytes(&mut body, &token);

        match parse_auth_response(&body).unwrap() {
            AuthResponseBody::Password { username, password } => {
                assert_eq!(username, "alice");
                assert_eq!(password, b"s3cret");
            }
            _ => panic!("expected password layout"),
        }
    }

    #[test]
    fn opaque_gss_token_is_not_mistaken_for_password_layout() {
        let mut body = BytesMut::new();
        write_bytes(&mut body, &[0x60, 0x1, 0x2, 0x3]); // GSS tokens start with 0x60 (APPLICATION tag)
        match parse_auth_response(&body).unwrap() {
            AuthResponseBody::Opaque(token) => assert_eq!(token, vec![0x60, 0x1, 0x2, 0x3]),
            _ => panic!("expected opaque token"),
        }
    }

    #[test]
    fn negative_length_bytes_means_empty() {
        let mut body = BytesMut::new();
        body.put_i32(-1);
        let token = read_bytes(&mut &body[..]).unwrap();
        assert!(token.is_empty());
    }

    #[test]
    fn query_body_is_a_long_string() {
        let mut body = BytesMut::new();
        body.put_u32(8);
        body.extend_from_slice(b"SELECT 1");
        assert_eq!(parse_query(&body).unwrap(), "SELECT 1");
    }

    #[test]
    fn batch_statements_survive_mixed_text_and_prepared_ids() {
        let mut body = BytesMut::new();
        body.put_u8(0); // LOGGED
        body.put_u16(2);

        body.put_u8(0); // kind 0: query string
        let q = b"INSERT INTO t (a) VALUES (1)";
        body.put_u32(q.len() as u32);
        body.extend_from_slice(q);
        body.put_u16(0); // zero values

        body.put_u8(1); // kind 1: prepared id
        body.put_u16(2);
        body.extend_from_slice(&[0xAB, 0xCD]);
        body.put_u16(1);
        write_bytes(&mut body, b"v1");

        let stmts = parse_batch(&body).unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].text.as_deref(), Some("INSERT INTO t (a) VALUES (1)"));
        assert_eq!(stmts[1].text, None);
    }

    #[test]
    fn register_body_lists_event_types() {
        let mut body = BytesMut::new();
        body.put_u16(2);
        write_u16_string(&mut body, "TOPOLOGY_CHANGE");
        write_u16_string(&mut body, "STATUS_CHANGE");
        let events = parse_register(&body).unwrap();
        assert_eq!(events, vec!["TOPOLOGY_CHANGE", "STATUS_CHANGE"]);
    }

    #[test]
    fn encode_supported_sets_response_bit() {
        let frame = encode_supported(4, 7, &[("CQL_VERSION", &["3.4.5"])]);
        assert_eq!(frame[0], 4 | 0x80);
        assert_eq!(i16::from_be_bytes([frame[2], frame[3]]), 7);
        assert_eq!(frame[4], OP_SUPPORTED);
    }

    #[test]
    fn encode_auth_response_clears_response_bit() {
        let frame = encode_auth_response(5, 42, b"token");
        assert_eq!(frame[0], 5);
        assert_eq!(i16::from_be_bytes([frame[2], frame[3]]), 42);
        assert_eq!(frame[4], OP_AUTH_RESPONSE);
    }

    #[test]
    fn encode_error_carries_auth_error_code_and_message() {
        let frame = encode_error(4, 1, AUTH_ERROR_CODE, "bad credentials");
        let header = FrameHeader::parse(&frame).unwrap();
        assert_eq!(header.opcode, OP_ERROR);
        let body = FrameHeader::body(&frame);
        let code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        assert_eq!(code, AUTH_ERROR_CODE);
    }
}
