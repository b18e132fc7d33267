use std::fmt::Write;

use bytes::{Bytes, BytesMut};
use http::{StatusCode, Version};
use tracing::{debug, trace};

use crate::error::User;

use super::date;

use self::Kind::{Chunked, CloseDelimited, Length};

const AVERAGE_HEADER_SIZE: usize = 30;

/// Encoders to handle different response body framings.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Encoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    /// The application declared a Content-Length.
    ///
    /// The writer trusts it; a mismatch between the declared length and the
    /// emitted bytes is a fatal per-connection error.
    Length(u64),
    /// No length declared; each `send_body` call becomes one chunk.
    Chunked,
    /// HTTP/1.0 without a declared length: bytes are raw and the connection
    /// closes after the final chunk.
    CloseDelimited,
}

impl Encoder {
    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn chunked() -> Encoder {
        Encoder { kind: Kind::Chunked }
    }

    pub(crate) fn close_delimited() -> Encoder {
        Encoder {
            kind: Kind::CloseDelimited,
        }
    }

    /// Appends one `send_body` payload to `dst`, framed per the encoding.
    pub(crate) fn encode(&mut self, data: &[u8], dst: &mut BytesMut) -> crate::Result<()> {
        match self.kind {
            Length(ref mut remaining) => {
                if data.len() as u64 > *remaining {
                    debug!(
                        "body overruns declared content-length by {}B",
                        data.len() as u64 - *remaining
                    );
                    return Err(crate::Error::new_user(User::BodyLengthMismatch));
                }
                *remaining -= data.len() as u64;
                dst.extend_from_slice(data);
            }
            Chunked => {
                // An empty chunk would read as the terminator; skip it.
                if !data.is_empty() {
                    trace!("encoding chunked {}B", data.len());
                    let _ = write!(dst, "{:x}\r\n", data.len());
                    dst.extend_from_slice(data);
                    dst.extend_from_slice(b"\r\n");
                }
            }
            CloseDelimited => {
                trace!("close delimited write {}B", data.len());
                dst.extend_from_slice(data);
            }
        }
        Ok(())
    }

    /// Finishes the body. Returns true when the connection must close for
    /// the peer to see the end of the response.
    pub(crate) fn end(&mut self, dst: &mut BytesMut) -> crate::Result<bool> {
        match self.kind {
            Length(0) => Ok(false),
            Length(missing) => {
                debug!("body ended {}B short of declared content-length", missing);
                Err(crate::Error::new_user(User::BodyLengthMismatch))
            }
            Chunked => {
                dst.extend_from_slice(b"0\r\n\r\n");
                Ok(false)
            }
            CloseDelimited => Ok(true),
        }
    }
}

/// Writes the status line and headers for a response and picks the body
/// encoder.
///
/// The application's headers are written verbatim, in order. When no body
/// framing is declared, chunked transfer encoding is injected for HTTP/1.1
/// and close-delimiting is used for HTTP/1.0. A `date` header is appended
/// when the application did not set one.
///
/// Returns the encoder plus whether the response itself asked for the
/// connection to close.
pub(crate) fn encode_head(
    status: u16,
    headers: &[(Bytes, Bytes)],
    version: Version,
    dst: &mut BytesMut,
) -> (Encoder, bool) {
    dst.reserve(30 + headers.len() * AVERAGE_HEADER_SIZE);
    match version {
        Version::HTTP_10 => dst.extend_from_slice(b"HTTP/1.0 "),
        _ => dst.extend_from_slice(b"HTTP/1.1 "),
    }
    let mut buffer = itoa::Buffer::new();
    dst.extend_from_slice(buffer.format(status).as_bytes());
    dst.extend_from_slice(b" ");
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Unknown");
    dst.extend_from_slice(reason.as_bytes());
    dst.extend_from_slice(b"\r\n");

    let mut content_length: Option<u64> = None;
    let mut chunked_declared = false;
    let mut date_seen = false;
    let mut wants_close = false;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(b"content-length") {
            content_length = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.trim().parse().ok());
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            chunked_declared = true;
        } else if name.eq_ignore_ascii_case(b"date") {
            date_seen = true;
        } else if name.eq_ignore_ascii_case(b"connection") {
            wants_close = value
                .split(|&b| b == b',')
                .any(|token| trim_bytes(token).eq_ignore_ascii_case(b"close"));
        }
        dst.extend_from_slice(name);
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value);
        dst.extend_from_slice(b"\r\n");
    }

    let encoder = if let Some(len) = content_length {
        Encoder::length(len)
    } else if chunked_declared {
        Encoder::chunked()
    } else if version == Version::HTTP_10 {
        wants_close = true;
        Encoder::close_delimited()
    } else {
        dst.extend_from_slice(b"transfer-encoding: chunked\r\n");
        Encoder::chunked()
    };

    if !date_seen {
        dst.extend_from_slice(b"date: ");
        date::extend(dst);
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
    (encoder, wants_close)
}

fn trim_bytes(mut bytes: &[u8]) -> &[u8] {
    while let Some((first, rest)) = bytes.split_first() {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let Some((last, rest)) = bytes.split_last() {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(status: u16, headers: &[(&str, &str)], version: Version) -> (String, Encoder, bool) {
        let headers: Vec<(Bytes, Bytes)> = headers
            .iter()
            .map(|(name, value)| {
                (
                    Bytes::copy_from_slice(name.as_bytes()),
                    Bytes::copy_from_slice(value.as_bytes()),
                )
            })
            .collect();
        let mut dst = BytesMut::new();
        let (encoder, close) = encode_head(status, &headers, version, &mut dst);
        (String::from_utf8(dst.to_vec()).unwrap(), encoder, close)
    }

    #[test]
    fn status_line_uses_iana_reason() {
        let (text, _, _) = head(404, &[("content-length", "0")], Version::HTTP_11);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", text);
    }

    #[test]
    fn declared_length_is_trusted() {
        let (text, mut encoder, close) =
            head(200, &[("content-length", "5")], Version::HTTP_11);
        assert!(!close);
        assert!(!text.contains("transfer-encoding"), "{}", text);
        let mut body = BytesMut::new();
        encoder.encode(b"hello", &mut body).unwrap();
        assert_eq!(&body[..], b"hello");
        assert!(!encoder.end(&mut body).unwrap());
    }

    #[test]
    fn length_overrun_is_an_error() {
        let mut encoder = Encoder::length(3);
        let mut body = BytesMut::new();
        assert!(encoder.encode(b"....", &mut body).is_err());
    }

    #[test]
    fn length_underrun_is_an_error() {
        let mut encoder = Encoder::length(8);
        let mut body = BytesMut::new();
        encoder.encode(b"1234", &mut body).unwrap();
        assert!(encoder.end(&mut body).is_err());
    }

    #[test]
    fn undeclared_length_turns_chunked() {
        let (text, mut encoder, _) = head(200, &[], Version::HTTP_11);
        assert!(text.contains("transfer-encoding: chunked\r\n"), "{}", text);
        let mut body = BytesMut::new();
        encoder.encode(b"hello", &mut body).unwrap();
        encoder.encode(b" world", &mut body).unwrap();
        assert!(!encoder.end(&mut body).unwrap());
        assert_eq!(&body[..], b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
    }

    #[test]
    fn empty_chunk_is_not_emitted() {
        let mut encoder = Encoder::chunked();
        let mut body = BytesMut::new();
        encoder.encode(b"", &mut body).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn http10_without_length_close_delimits() {
        let (text, mut encoder, close) = head(200, &[], Version::HTTP_10);
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(!text.contains("transfer-encoding"));
        assert!(close);
        let mut body = BytesMut::new();
        encoder.encode(b"raw", &mut body).unwrap();
        assert!(encoder.end(&mut body).unwrap());
        assert_eq!(&body[..], b"raw");
    }

    #[test]
    fn connection_close_header_detected() {
        let (_, _, close) = head(
            200,
            &[("content-length", "0"), ("connection", "close")],
            Version::HTTP_11,
        );
        assert!(close);
    }

    #[test]
    fn date_header_appended_once() {
        let (text, _, _) = head(200, &[("content-length", "0")], Version::HTTP_11);
        assert_eq!(text.matches("date: ").count(), 1, "{}", text);
        let (text, _, _) = head(
            200,
            &[("content-length", "0"), ("date", "today")],
            Version::HTTP_11,
        );
        assert!(!text.contains("date: today\r\ndate:"), "{}", text);
        assert_eq!(text.matches("\r\ndate").count(), 1, "{}", text);
    }
}
