use bytes::{Buf, Bytes, BytesMut};
use http::{Method, Version};
use percent_encoding::percent_decode;
use tracing::{debug, trace};

use crate::error::Parse;
use crate::proto::{BodyLength, RequestHead};

pub(crate) const MAX_HEADERS: usize = 100;

/// Outcome of a head parse attempt.
#[derive(Debug)]
pub(crate) enum ParseStatus {
    /// The head was complete; its bytes have been consumed from the buffer.
    Complete(RequestHead),
    /// More bytes are needed.
    Partial,
}

/// Tries to parse a request head from the front of `buf`.
///
/// On success the head bytes (through the final CRLFCRLF) are consumed.
/// `max_head_size` bounds how large the unparsed head may grow; past it the
/// error is reported as too-large so the connection can answer 413.
pub(crate) fn parse_head(buf: &mut BytesMut, max_head_size: usize) -> crate::Result<ParseStatus> {
    if buf.is_empty() {
        return Ok(ParseStatus::Partial);
    }
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    trace!("parse_head ({} buffered bytes)", buf.len());

    let status = req.parse(buf).map_err(|e| {
        debug!("head parse error: {}", e);
        match e {
            httparse::Error::TooManyHeaders => crate::Error::new_parse(Parse::TooLarge),
            httparse::Error::Version => crate::Error::new_parse(Parse::Version),
            _ => crate::Error::new_parse(Parse::Header),
        }
    })?;
    let len = match status {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            return if buf.len() > max_head_size {
                Err(crate::Error::new_parse(Parse::TooLarge))
            } else {
                Ok(ParseStatus::Partial)
            };
        }
    };
    if len > max_head_size {
        return Err(crate::Error::new_parse(Parse::TooLarge));
    }

    let method = Method::from_bytes(req.method.unwrap_or("").as_bytes())
        .map_err(|_| crate::Error::new_parse(Parse::Method))?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(crate::Error::new_parse(Parse::Version)),
    };

    let target = req.path.ok_or_else(|| crate::Error::new_parse(Parse::Uri))?;
    let (raw_path, query) = match target.find('?') {
        Some(at) => (&target[..at], &target[at + 1..]),
        None => (target, ""),
    };
    let path = percent_decode(raw_path.as_bytes())
        .decode_utf8()
        .map_err(|_| crate::Error::new_parse(Parse::Uri))?
        .into_owned();
    let query = Bytes::copy_from_slice(query.as_bytes());

    let mut head_headers = Vec::with_capacity(req.headers.len());
    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut te_seen = false;
    let mut keep_alive = version == Version::HTTP_11;
    let mut expect_continue = false;

    for header in req.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        let value = Bytes::copy_from_slice(header.value);

        match name.as_str() {
            "content-length" => {
                let parsed = std::str::from_utf8(header.value)
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or_else(|| crate::Error::new_parse(Parse::Header))?;
                match content_length {
                    // Repeated content-length is fine only when identical.
                    Some(prior) if prior != parsed => {
                        return Err(crate::Error::new_parse(Parse::Header));
                    }
                    _ => content_length = Some(parsed),
                }
            }
            "transfer-encoding" => {
                te_seen = true;
                // For requests, chunked must be the final encoding; anything
                // else means the length cannot be determined (RFC 7230 §3.3.3).
                let value_str = std::str::from_utf8(header.value)
                    .map_err(|_| crate::Error::new_parse(Parse::Header))?;
                chunked = value_str
                    .rsplit(',')
                    .next()
                    .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
                    .unwrap_or(false);
            }
            "connection" => {
                for token in std::str::from_utf8(header.value).unwrap_or("").split(',') {
                    let token = token.trim();
                    if token.eq_ignore_ascii_case("close") {
                        keep_alive = false;
                    } else if token.eq_ignore_ascii_case("keep-alive") {
                        keep_alive = true;
                    }
                }
            }
            "expect" => {
                expect_continue = header.value.eq_ignore_ascii_case(b"100-continue");
            }
            _ => {}
        }
        head_headers.push((Bytes::from(name), value));
    }

    if te_seen && !chunked {
        debug!("transfer-encoding present but not chunked-final");
        return Err(crate::Error::new_parse(Parse::Header));
    }
    if te_seen && content_length.is_some() {
        debug!("both transfer-encoding and content-length present");
        return Err(crate::Error::new_parse(Parse::Header));
    }

    let body = if chunked {
        BodyLength::Chunked
    } else {
        BodyLength::Known(content_length.unwrap_or(0))
    };

    buf.advance(len);

    Ok(ParseStatus::Complete(RequestHead {
        method,
        path,
        query,
        version,
        headers: head_headers,
        keep_alive,
        expect_continue,
        body,
    }))
}
