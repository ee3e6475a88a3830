//! Control-plane request framing.
//!
//! A request is `<path>[ SP <payload>]\x00`. The payload may contain any byte
//! except NUL (including newlines); only the first whitespace rune separates
//! the path from the payload. Responses are free-form and handled by the
//! server crate.

use crate::error::ProtocolError;

/// A parsed control-plane request.
///
/// `path` is borrowed verbatim; the server lowercases it before routing.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestFrame<'a> {
    pub path: &'a str,
    pub payload: Option<&'a [u8]>,
}

/// Parse one request frame.
///
/// `frame` must contain the bytes up to but not including the NUL terminator
/// (the server strips it while reading). The path must be valid UTF-8; the
/// payload is raw bytes.
pub fn parse_request(frame: &[u8]) -> Result<RequestFrame<'_>, ProtocolError> {
    if frame.contains(&0) {
        // The terminator is stripped by the transport; an embedded NUL means
        // the framing got out of sync.
        return Err(ProtocolError::UnterminatedRequest);
    }

    // The payload is raw bytes, so only the prefix up to the first whitespace
    // rune has to be valid UTF-8. Scan the longest valid prefix for it.
    let valid = match std::str::from_utf8(frame) {
        Ok(s) => s,
        Err(e) => std::str::from_utf8(&frame[..e.valid_up_to()]).expect("valid prefix"),
    };

    match valid.char_indices().find(|(_, c)| c.is_whitespace()) {
        Some((at, sep)) => Ok(RequestFrame {
            path: &valid[..at],
            payload: Some(&frame[at + sep.len_utf8()..]),
        }),
        None if valid.len() == frame.len() => Ok(RequestFrame {
            path: valid,
            payload: None,
        }),
        // Invalid bytes before any separator sit inside the path itself.
        None => Err(ProtocolError::BadPath),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_only() {
        let req = parse_request(b"ping").unwrap();
        assert_eq!(req.path, "ping");
        assert_eq!(req.payload, None);
    }

    #[test]
    fn path_and_payload() {
        let req = parse_request(b"bus/create 7").unwrap();
        assert_eq!(req.path, "bus/create");
        assert_eq!(req.payload, Some(&b"7"[..]));
    }

    #[test]
    fn payload_keeps_embedded_whitespace_and_newlines() {
        let req = parse_request(b"bus/1/add {\"type\": \"xbox360\"}\nmore").unwrap();
        assert_eq!(req.path, "bus/1/add");
        assert_eq!(req.payload, Some(&b"{\"type\": \"xbox360\"}\nmore"[..]));
    }

    #[test]
    fn payload_may_be_arbitrary_bytes() {
        let req = parse_request(b"x \xff\xfe\x01").unwrap();
        assert_eq!(req.path, "x");
        assert_eq!(req.payload, Some(&b"\xff\xfe\x01"[..]));
    }

    #[test]
    fn non_utf8_path_is_rejected() {
        assert_eq!(parse_request(b"\xffping"), Err(ProtocolError::BadPath));
    }

    #[test]
    fn embedded_nul_is_rejected() {
        assert!(parse_request(b"ping\0x").is_err());
    }
}
