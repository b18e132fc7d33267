//! Signed cookie sessions.
//!
//! The whole session is one `session` cookie: a URL-safe base64 JSON payload
//! followed by `.` and an HMAC-SHA256 tag over the encoded payload. Inbound
//! values that fail the signature check (or do not decode) start an empty
//! session rather than erroring a request.

use std::env;

use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use super::cookies::Cookies;

type HmacSha256 = Hmac<Sha256>;

const SESSION_COOKIE: &str = "session";
const DEV_KEY: &str = "hearth-development";

/// Signs and verifies session payloads.
#[derive(Clone)]
pub struct SessionSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for SessionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The key never leaves the struct.
        f.debug_struct("SessionSigner").finish()
    }
}

impl SessionSigner {
    pub fn new(secret: &str) -> SessionSigner {
        SessionSigner {
            key: secret.as_bytes().to_vec(),
        }
    }

    /// Reads `SECURE_KEY` from the environment. Without it, a fixed
    /// development key is used when `DEBUG` is truthy; otherwise the runtime
    /// refuses to start, because sessions would be forgeable.
    pub fn from_env() -> crate::Result<SessionSigner> {
        match env::var("SECURE_KEY") {
            Ok(key) if !key.is_empty() => Ok(SessionSigner::new(&key)),
            _ => {
                if debug_enabled() {
                    warn!("SECURE_KEY is not set; sessions use an insecure development key");
                    Ok(SessionSigner::new(DEV_KEY))
                } else {
                    Err(crate::Error::new_config(MissingSecureKey))
                }
            }
        }
    }

    fn mac(&self, payload: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any size");
        mac.update(payload);
        mac
    }

    pub(crate) fn dumps(&self, map: &Map<String, Value>) -> String {
        let json = serde_json::to_vec(map).unwrap_or_else(|_| b"{}".to_vec());
        let payload = URL_SAFE_NO_PAD.encode(json);
        let tag = self.mac(payload.as_bytes()).finalize().into_bytes();
        let mut out = payload;
        out.push('.');
        out.push_str(&URL_SAFE_NO_PAD.encode(tag));
        out
    }

    pub(crate) fn loads(&self, raw: &[u8]) -> Option<Map<String, Value>> {
        let raw = std::str::from_utf8(raw).ok()?;
        let dot = raw.rfind('.')?;
        let (payload, tag_b64) = (&raw[..dot], &raw[dot + 1..]);
        let tag = URL_SAFE_NO_PAD.decode(tag_b64).ok()?;
        if self.mac(payload.as_bytes()).verify_slice(&tag).is_err() {
            debug!("session cookie failed signature verification");
            return None;
        }
        let json = URL_SAFE_NO_PAD.decode(payload).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

/// `DEBUG` counts as truthy unless empty, "0" or "false".
fn debug_enabled() -> bool {
    match env::var("DEBUG") {
        Ok(value) => {
            !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
        }
        Err(_) => false,
    }
}

#[derive(Debug)]
struct MissingSecureKey;

impl std::fmt::Display for MissingSecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(
            "SECURE_KEY is required for sessions; set it, or set DEBUG=1 \
             during development to accept forgeable sessions",
        )
    }
}

impl std::error::Error for MissingSecureKey {}

/// A per-request, string-keyed session mapping.
///
/// Reads never set the dirty flag; writes always do. A dirty session is
/// flushed into the cookie jar before response headers are produced.
pub struct Session {
    map: Map<String, Value>,
    dirty: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("keys", &self.map.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Session {
    pub(crate) fn from_cookies(cookies: &Cookies, signer: &SessionSigner) -> Session {
        let map = cookies
            .get(SESSION_COOKIE)
            .and_then(|raw| signer.loads(raw))
            .unwrap_or_default();
        Session { map, dirty: false }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.dirty = true;
        self.map.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.map.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Writes the signed session into the cookie jar, if anything changed.
    pub(crate) fn flush_into(&self, cookies: &mut Cookies, signer: &SessionSigner) {
        if !self.dirty {
            return;
        }
        cookies.insert(SESSION_COOKIE, signer.dumps(&self.map).into_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn signer() -> SessionSigner {
        SessionSigner::new("test-secret")
    }

    fn cookies_with_session(value: &str) -> Cookies {
        let mut cookies = Cookies::new();
        cookies.insert(SESSION_COOKIE, value.as_bytes().to_vec());
        cookies
    }

    #[test]
    fn round_trip() {
        let signer = signer();
        let mut session = Session::from_cookies(&Cookies::new(), &signer);
        session.insert("user", "ferris");
        session.insert("visits", 3);

        let mut cookies = Cookies::new();
        session.flush_into(&mut cookies, &signer);
        let raw = cookies.get(SESSION_COOKIE).unwrap().clone();

        let restored =
            Session::from_cookies(&cookies_with_session(std::str::from_utf8(&raw).unwrap()), &signer);
        assert_eq!(restored.get("user"), Some(&Value::from("ferris")));
        assert_eq!(restored.get("visits"), Some(&Value::from(3)));
        assert!(!restored.is_dirty());
    }

    #[test]
    fn reads_do_not_dirty_writes_do() {
        let signer = signer();
        let mut session = Session::from_cookies(&Cookies::new(), &signer);
        assert!(session.get("missing").is_none());
        assert!(!session.is_dirty());
        session.insert("k", "v");
        assert!(session.is_dirty());
    }

    #[test]
    fn clean_session_is_not_flushed() {
        let signer = signer();
        let session = Session::from_cookies(&Cookies::new(), &signer);
        let mut cookies = Cookies::new();
        let dirty_before = cookies.is_dirty();
        session.flush_into(&mut cookies, &signer);
        assert_eq!(cookies.is_dirty(), dirty_before);
        assert!(cookies.get(SESSION_COOKIE).is_none());
    }

    #[test]
    fn tampered_payload_starts_empty() {
        let signer = signer();
        let mut session = Session::from_cookies(&Cookies::new(), &signer);
        session.insert("admin", false);
        let mut cookies = Cookies::new();
        session.flush_into(&mut cookies, &signer);

        let raw = cookies.get(SESSION_COOKIE).unwrap();
        let mut tampered = String::from_utf8(raw.to_vec()).unwrap();
        // Flip a payload character without touching the tag.
        tampered.replace_range(0..1, if tampered.starts_with('A') { "B" } else { "A" });
        let restored = Session::from_cookies(&cookies_with_session(&tampered), &signer);
        assert!(restored.is_empty());
    }

    #[test]
    fn wrong_key_starts_empty() {
        let signer = signer();
        let mut session = Session::from_cookies(&Cookies::new(), &signer);
        session.insert("k", "v");
        let mut cookies = Cookies::new();
        session.flush_into(&mut cookies, &signer);

        let other = SessionSigner::new("other-secret");
        let raw = cookies.get(SESSION_COOKIE).unwrap().clone();
        let restored = Session::from_cookies(
            &cookies_with_session(std::str::from_utf8(&raw).unwrap()),
            &other,
        );
        assert!(restored.is_empty());
    }

    #[test]
    fn garbage_cookie_starts_empty() {
        let signer = signer();
        let mut cookies = Cookies::new();
        cookies.insert(SESSION_COOKIE, Bytes::from_static(b"not.signed"));
        let session = Session::from_cookies(&cookies, &signer);
        assert!(session.is_empty());
    }
}
