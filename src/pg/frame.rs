//! PG Frame Splitter (§4.3). Stateful, single-direction: partitions a byte
//! stream into a startup-frame followed by typed frames.

use bytes::BytesMut;
use thiserror::Error;

use crate::pg::message::{CODE_CANCEL_REQUEST, CODE_GSSENC_REQUEST, CODE_SSL_REQUEST};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame: length {0} < 4")]
    InvalidLength(usize),
}

/// Splits a byte stream into whole PG frames. The frontend direction starts
/// with `startup_processed = false` (one startup-frame, no type byte) and
/// only flips to typed-frame mode once a genuine StartupMessage has been
/// emitted; SSLRequest/GSSENCRequest/CancelRequest are startup-shaped too but
/// leave the splitter in startup mode, since libpq's default `sslmode=prefer`
/// sends SSLRequest first and the real StartupMessage afterward on the same
/// connection. The backend direction never sees a startup frame and is
/// typed-frame mode from creation.
#[derive(Debug, Clone)]
pub struct FrameSplitter {
    startup_processed: bool,
}

impl FrameSplitter {
    pub fn frontend() -> Self {
        Self {
            startup_processed: false,
        }
    }

    pub fn backend() -> Self {
        Self {
            startup_processed: true,
        }
    }

    pub fn startup_processed(&self) -> bool {
        self.startup_processed
    }

    /// Split one whole frame off the front of `buf`, if enough bytes are
    /// buffered. Unreadable partial frames yield `Ok(None)`, not an error;
    /// only an impossible advertised length is an error.
    pub fn split(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        if !self.startup_processed {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if len < 4 {
                return Err(FrameError::InvalidLength(len));
            }
            if buf.len() < len {
                return Ok(None);
            }

            // A startup-shaped frame is only a genuine StartupMessage if its
            // request code isn't one of the three special non-StartupMessage
            // codes; those keep the splitter in startup mode so the real
            // StartupMessage that follows on the same connection is still
            // parsed startup-shaped, not mistaken for a typed frame.
            let is_startup_message = len >= 8 && {
                let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
                !matches!(code, CODE_SSL_REQUEST | CODE_GSSENC_REQUEST | CODE_CANCEL_REQUEST)
            };

            let frame = buf.split_to(len);
            if is_startup_message {
                self.startup_processed = true;
            }
            Ok(Some(frame))
        } else {
            if buf.len() < 5 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            if len < 4 {
                return Err(FrameError::InvalidLength(len));
            }
            let total = len + 1;
            if buf.len() < total {
                return Ok(None);
            }
            Ok(Some(buf.split_to(total)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontend_waits_for_full_startup_frame() {
        let mut splitter = FrameSplitter::frontend();
        let mut buf = BytesMut::from(&b"\x00\x00\x00"[..]);
        assert_eq!(splitter.split(&mut buf).unwrap(), None);
        assert!(!splitter.startup_processed());
    }

    #[test]
    fn frontend_emits_ssl_request_without_flipping() {
        let mut splitter = FrameSplitter::frontend();
        let mut payload = vec![0, 0, 0, 8];
        payload.extend_from_slice(&CODE_SSL_REQUEST.to_be_bytes());
        let mut buf = BytesMut::from(&payload[..]);
        let frame = splitter.split(&mut buf).unwrap().expect("frame");
        assert_eq!(frame.len(), 8);
        assert!(buf.is_empty());
        assert!(!splitter.startup_processed());
    }

    #[test]
    fn ssl_request_then_startup_message_both_parse_startup_shaped() {
        let mut splitter = FrameSplitter::frontend();

        let mut ssl_frame = vec![0, 0, 0, 8];
        ssl_frame.extend_from_slice(&CODE_SSL_REQUEST.to_be_bytes());
        let mut buf = BytesMut::from(&ssl_frame[..]);
        splitter.split(&mut buf).unwrap().expect("ssl request frame");
        assert!(!splitter.startup_processed(), "SSLRequest must not flip the splitter");

        // Real libpq behavior: StartupMessage follows on the same connection
        // after the SSLRequest is refused with 'N'.
        let mut startup_body = vec![0, 3, 0, 0]; // protocol 3.0
        startup_body.extend_from_slice(b"user\0alice\0\0");
        let mut startup_frame = ((4 + startup_body.len()) as u32).to_be_bytes().to_vec();
        startup_frame.extend_from_slice(&startup_body);
        let mut buf2 = BytesMut::from(&startup_frame[..]);

        let frame = splitter.split(&mut buf2).unwrap().expect("startup message frame");
        assert_eq!(frame.len(), startup_frame.len());
        assert!(splitter.startup_processed(), "a genuine StartupMessage must flip the splitter");
    }

    #[test]
    fn frontend_rejects_impossible_length() {
        let mut splitter = FrameSplitter::frontend();
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x02"[..]);
        assert_eq!(
            splitter.split(&mut buf).unwrap_err(),
            FrameError::InvalidLength(2)
        );
    }

    #[test]
    fn typed_frame_waits_for_header() {
        let mut splitter = FrameSplitter::backend();
        let mut buf = BytesMut::from(&b"Q\x00\x00"[..]);
        assert_eq!(splitter.split(&mut buf).unwrap(), None);
    }

    #[test]
    fn typed_frame_emits_type_plus_length() {
        let mut splitter = FrameSplitter::backend();
        let mut buf = BytesMut::from(&b"Q\x00\x00\x00\x09SELECT 1\0extra"[..]);
        let frame = splitter.split(&mut buf).unwrap().expect("frame");
        assert_eq!(frame.len(), 10); // 1 type byte + 9 (length incl itself)
        assert_eq!(&frame[0..1], b"Q");
        assert_eq!(&buf[..], b"extra");
    }

    #[test]
    fn leaves_no_residual_bytes_across_back_to_back_frames() {
        let mut splitter = FrameSplitter::backend();
        let mut buf = BytesMut::from(&b"S\x00\x00\x00\x04Z\x00\x00\x00\x05I"[..]);
        let first = splitter.split(&mut buf).unwrap().expect("first");
        assert_eq!(&first[..], b"S\x00\x00\x00\x04");
        let second = splitter.split(&mut buf).unwrap().expect("second");
        assert_eq!(&second[..], b"Z\x00\x00\x00\x05I");
        assert!(buf.is_empty());
    }
}
