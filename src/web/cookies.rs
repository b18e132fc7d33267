//! Request/response cookies.

use bytes::Bytes;

/// An ordered name→value cookie mapping.
///
/// Values stay bytes. The dirty flag is set by any mutation; a dirty jar is
/// serialized back onto the response as one `Set-Cookie` header per entry.
#[derive(Default)]
pub struct Cookies {
    entries: Vec<(String, Bytes)>,
    dirty: bool,
}

impl std::fmt::Debug for Cookies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cookies")
            .field("entries", &self.entries.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Cookies {
    pub fn new() -> Cookies {
        Cookies::default()
    }

    /// Parses the first `cookie` header: `name1=val1; name2=val2`.
    pub(crate) fn from_headers(headers: &[(Bytes, Bytes)]) -> Cookies {
        let raw = headers
            .iter()
            .find(|(name, _)| name.as_ref() == b"cookie")
            .map(|(_, value)| value.clone());
        let raw = match raw {
            Some(raw) => raw,
            None => return Cookies::new(),
        };

        let mut entries = Vec::new();
        for pair in split_pairs(&raw) {
            let eq = match pair.iter().position(|&b| b == b'=') {
                Some(eq) => eq,
                None => continue,
            };
            let name = match std::str::from_utf8(&pair[..eq]) {
                Ok(name) => name.to_owned(),
                Err(_) => continue,
            };
            entries.push((name, Bytes::copy_from_slice(&pair[eq + 1..])));
        }
        Cookies {
            entries,
            dirty: false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, value)| value)
    }

    /// Sets a cookie, updating in place when the name exists.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        let name = name.into();
        let value = value.into();
        self.dirty = true;
        match self.entries.iter_mut().find(|(entry, _)| *entry == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Bytes> {
        let at = self.entries.iter().position(|(entry, _)| entry == name)?;
        self.dirty = true;
        Some(self.entries.remove(at).1)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// One `Set-Cookie: name=value` header per entry, in order.
    pub(crate) fn to_set_cookie_headers(&self) -> Vec<(Bytes, Bytes)> {
        self.entries
            .iter()
            .map(|(name, value)| {
                let mut header = Vec::with_capacity(name.len() + 1 + value.len());
                header.extend_from_slice(name.as_bytes());
                header.push(b'=');
                header.extend_from_slice(value);
                (Bytes::from_static(b"set-cookie"), Bytes::from(header))
            })
            .collect()
    }
}

/// Splits on the literal `"; "` separator.
fn split_pairs(raw: &[u8]) -> Vec<&[u8]> {
    let mut pairs = Vec::new();
    let mut start = 0;
    let mut at = 0;
    while at + 1 < raw.len() {
        if raw[at] == b';' && raw[at + 1] == b' ' {
            pairs.push(&raw[start..at]);
            start = at + 2;
            at = start;
        } else {
            at += 1;
        }
    }
    pairs.push(&raw[start..]);
    pairs
}
