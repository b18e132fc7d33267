//! Response building helpers.

use bytes::Bytes;
use serde::Serialize;

/// A buffered response: status, extra headers, body, content type.
///
/// `content-length` always matches the body; streaming responses go through
/// the gateway handles directly instead.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: Vec<(Bytes, Bytes)>,
    body: Bytes,
    content_type: Option<Bytes>,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
            content_type: None,
        }
    }

    /// A `text/plain; charset=utf-8` response with status 200.
    pub fn text(body: impl Into<String>) -> Response {
        Response::new(200)
            .content_type("text/plain; charset=utf-8")
            .body(body.into().into_bytes())
    }

    /// An `application/json` response with status 200.
    pub fn json<T: Serialize>(value: &T) -> crate::Result<Response> {
        let body = serde_json::to_vec(value).map_err(crate::Error::new_handler)?;
        Ok(Response::new(200)
            .content_type("application/json")
            .body(body))
    }

    pub fn status(mut self, status: u16) -> Response {
        self.status = status;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Response {
        self.body = body.into();
        self
    }

    pub fn content_type(mut self, content_type: impl Into<Bytes>) -> Response {
        self.content_type = Some(content_type.into());
        self
    }

    /// Appends an extra header.
    pub fn header(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Response {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Lowers to wire parts: `(status, headers, body)`. Header order is
    /// content-length, extra headers, then content-type.
    pub(crate) fn into_parts(self) -> (u16, Vec<(Bytes, Bytes)>, Bytes) {
        let mut headers = Vec::with_capacity(self.headers.len() + 2);
        let mut buffer = itoa::Buffer::new();
        headers.push((
            Bytes::from_static(b"content-length"),
            Bytes::copy_from_slice(buffer.format(self.body.len()).as_bytes()),
        ));
        headers.extend(self.headers);
        if let Some(content_type) = self.content_type {
            headers.push((Bytes::from_static(b"content-type"), content_type));
        }
        (self.status, headers, self.body)
    }
}
