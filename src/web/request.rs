//! The framework-level request.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use http::Method;

use crate::sgi::ReceiveHandle;

use super::cookies::Cookies;
use super::session::Session;

/// An ordered, case-preserving view over request headers.
///
/// Names were lower-cased by the transport; lookups lower-case the needle.
/// Duplicate headers keep their order.
pub struct Headers {
    entries: Vec<(Bytes, Bytes)>,
}

impl std::fmt::Debug for Headers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

impl Headers {
    pub(crate) fn new(entries: Vec<(Bytes, Bytes)>) -> Headers {
        Headers { entries }
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        let needle = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(entry, _)| entry.as_ref() == needle.as_bytes())
            .map(|(_, value)| value)
    }

    /// Every value for `name`, in arrival order.
    pub fn get_all(&self, name: &str) -> Vec<&Bytes> {
        let needle = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(entry, _)| entry.as_ref() == needle.as_bytes())
            .map(|(_, value)| value)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.entries.iter().map(|(name, value)| (name, value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Query parameters, split on `&` and the first `=`. Values stay bytes.
pub struct Parameters {
    pairs: Vec<(String, Bytes)>,
}

impl std::fmt::Debug for Parameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.pairs.iter()).finish()
    }
}

impl Parameters {
    pub(crate) fn from_raw(raw: &Bytes) -> Parameters {
        let mut pairs = Vec::new();
        if raw.is_empty() {
            return Parameters { pairs };
        }
        for pair in raw.split(|&b| b == b'&') {
            let eq = match pair.iter().position(|&b| b == b'=') {
                Some(eq) => eq,
                None => continue,
            };
            let key = match std::str::from_utf8(&pair[..eq]) {
                Ok(key) => key.to_owned(),
                Err(_) => continue,
            };
            pairs.push((key, Bytes::copy_from_slice(&pair[eq + 1..])));
        }
        Parameters { pairs }
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.pairs
            .iter()
            .find(|(entry, _)| entry == key)
            .map(|(_, value)| value)
    }

    /// The value decoded as UTF-8, when it is.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// One HTTP request as seen by endpoints.
///
/// Cheap to clone; every clone shares the same cookies, session and body
/// stream.
#[derive(Clone)]
pub struct Request {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.inner.method)
            .field("path", &self.inner.path)
            .finish()
    }
}

struct Inner {
    method: Method,
    path: String,
    query: Bytes,
    parameters: Parameters,
    args: Vec<(String, String)>,
    headers: Headers,
    cookies: RefCell<Cookies>,
    session: RefCell<Session>,
    receive: ReceiveHandle,
    more_body: Cell<bool>,
    client: Option<SocketAddr>,
    server: SocketAddr,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        path: String,
        query: Bytes,
        args: Vec<(String, String)>,
        headers: Vec<(Bytes, Bytes)>,
        cookies: Cookies,
        session: Session,
        receive: ReceiveHandle,
        client: Option<SocketAddr>,
        server: SocketAddr,
    ) -> Request {
        let parameters = Parameters::from_raw(&query);
        Request {
            inner: Rc::new(Inner {
                method,
                path,
                query,
                parameters,
                args,
                headers: Headers::new(headers),
                cookies: RefCell::new(cookies),
                session: RefCell::new(session),
                receive,
                more_body: Cell::new(true),
                client,
                server,
            }),
        }
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    /// The percent-decoded path of the request url.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// The raw query bytes of the request url.
    pub fn raw_query(&self) -> &Bytes {
        &self.inner.query
    }

    /// The parsed query parameters of the request url.
    pub fn query(&self) -> &Parameters {
        &self.inner.parameters
    }

    /// The raw captured route argument for `name`.
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.inner
            .args
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// The client's ip and port, when known.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.client
    }

    /// The server's ip and port.
    pub fn server_address(&self) -> SocketAddr {
        self.inner.server
    }

    pub fn cookies(&self) -> Ref<'_, Cookies> {
        self.inner.cookies.borrow()
    }

    pub fn cookies_mut(&self) -> RefMut<'_, Cookies> {
        self.inner.cookies.borrow_mut()
    }

    pub fn session(&self) -> Ref<'_, Session> {
        self.inner.session.borrow()
    }

    pub fn session_mut(&self) -> RefMut<'_, Session> {
        self.inner.session.borrow_mut()
    }

    /// Reads the next run of body bytes; `None` once the body has ended.
    pub async fn read(&self) -> crate::Result<Option<Bytes>> {
        if !self.inner.more_body.get() {
            return Ok(None);
        }
        let (more_body, data) = self.inner.receive.recv().await?;
        self.inner.more_body.set(more_body);
        if data.is_empty() && !more_body {
            return Ok(None);
        }
        Ok(Some(data))
    }

    /// Reads the body to its end.
    pub async fn bytes(&self) -> crate::Result<Bytes> {
        let mut buffer = BytesMut::new();
        while let Some(data) = self.read().await? {
            buffer.extend_from_slice(&data);
        }
        Ok(buffer.freeze())
    }

    /// Reads the whole body and decodes it as UTF-8.
    pub async fn text(&self) -> crate::Result<String> {
        let raw = self.bytes().await?;
        String::from_utf8(raw.to_vec()).map_err(crate::Error::new_handler)
    }

    /// Reads the whole body and parses it as JSON.
    pub async fn json(&self) -> crate::Result<serde_json::Value> {
        let raw = self.bytes().await?;
        serde_json::from_slice(&raw).map_err(crate::Error::new_handler)
    }

    /// Serializes session changes into the cookie jar.
    pub(crate) fn flush_session(&self, signer: &super::session::SessionSigner) {
        let session = self.inner.session.borrow();
        let mut cookies = self.inner.cookies.borrow_mut();
        session.flush_into(&mut cookies, signer);
    }

    pub(crate) fn cookies_dirty(&self) -> bool {
        self.inner.cookies.borrow().is_dirty()
    }

    pub(crate) fn set_cookie_headers(&self) -> Vec<(Bytes, Bytes)> {
        self.inner.cookies.borrow().to_set_cookie_headers()
    }
}
