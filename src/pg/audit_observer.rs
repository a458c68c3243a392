//! PG Backend Audit Observer (§4.8). Sniffs backend frames for
//! `CommandComplete`/`ErrorResponse` and projects them into result events.
//! Never mutates or drops the original buffer; the caller always forwards it
//! downstream regardless of what this module reports.

use crate::audit::ResultEvent;

/// Inspect one whole backend typed frame (tag + 4-byte length + payload) and
/// return a `ResultEvent` if it is one this proxy audits. Any other type is
/// ignored (`None`).
pub fn observe(frame: &[u8]) -> Option<ResultEvent> {
    if frame.len() < 5 {
        return None;
    }
    let tag = frame[0];
    let body = &frame[5..];

    match tag {
        b'C' => Some(ResultEvent::ok(parse_command_complete(body))),
        b'E' => parse_error_response(body).map(ResultEvent::error),
        _ => None,
    }
}

/// Read the NUL-terminated command tag and parse the trailing integer of
/// the last whitespace-separated token (`UPDATE 3` -> 3, `SELECT` -> 0).
fn parse_command_complete(body: &[u8]) -> i64 {
    let end = memchr::memchr(0, body).unwrap_or(body.len());
    let tag = match std::str::from_utf8(&body[..end]) {
        Ok(s) => s,
        Err(_) => return 0,
    };
    tag.split_whitespace()
        .last()
        .and_then(|tok| tok.parse::<i64>().ok())
        .unwrap_or(0)
}

/// Iterate field-type/value pairs until the zero field-type terminator;
/// capture field `M` (message).
fn parse_error_response(body: &[u8]) -> Option<String> {
    let mut rest = body;
    let mut message = None;

    while !rest.is_empty() && rest[0] != 0 {
        let field_type = rest[0];
        rest = &rest[1..];
        let end = memchr::memchr(0, rest)?;
        let value = std::str::from_utf8(&rest[..end]).ok()?;
        if field_type == b'M' {
            message = Some(value.to_string());
        }
        rest = &rest[end + 1..];
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn command_complete(tag: &str) -> BytesMut {
        let mut frame = BytesMut::new();
        frame.put_u8(b'C');
        frame.put_u32((4 + tag.len() + 1) as u32);
        frame.extend_from_slice(tag.as_bytes());
        frame.put_u8(0);
        frame
    }

    fn error_response(message: &str) -> BytesMut {
        let mut frame = BytesMut::new();
        frame.put_u8(b'E');
        let mut body = BytesMut::new();
        body.put_u8(b'M');
        body.extend_from_slice(message.as_bytes());
        body.put_u8(0);
        body.put_u8(0);
        frame.put_u32((4 + body.len()) as u32);
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn update_command_complete_reports_affected_rows() {
        let frame = command_complete("UPDATE 3");
        let event = observe(&frame).unwrap();
        assert_eq!(event.affected, 3);
        assert!(event.error.is_none());
    }

    #[test]
    fn select_without_count_reports_zero() {
        let frame = command_complete("SELECT");
        let event = observe(&frame).unwrap();
        assert_eq!(event.affected, 0);
    }

    #[test]
    fn error_response_captures_message_field() {
        let frame = error_response("relation \"t\" does not exist");
        let event = observe(&frame).unwrap();
        assert_eq!(event.error.as_deref(), Some("relation \"t\" does not exist"));
    }

    #[test]
    fn other_types_are_ignored() {
        let mut frame = BytesMut::new();
        frame.put_u8(b'Z');
        frame.put_u32(5);
        frame.put_u8(b'I');
        assert!(observe(&frame).is_none());
    }
}
