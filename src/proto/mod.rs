//! The HTTP/1.1 protocol core: head parsing, body decoding, response
//! encoding, and the per-connection state machine.

pub(crate) mod h1;

use bytes::Bytes;
use http::{Method, Version};

/// A parsed request head, ready for dispatch.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    /// Percent-decoded path, without the query string.
    pub(crate) path: String,
    /// Raw query bytes; no decoding is applied.
    pub(crate) query: Bytes,
    pub(crate) version: Version,
    /// Ordered header pairs. Names are lower-cased; duplicates preserved.
    pub(crate) headers: Vec<(Bytes, Bytes)>,
    pub(crate) keep_alive: bool,
    pub(crate) expect_continue: bool,
    pub(crate) body: BodyLength,
}

/// How the request body is framed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BodyLength {
    /// Content-Length, or 0 when no body is expected.
    Known(u64),
    /// Transfer-Encoding: chunked.
    Chunked,
}
