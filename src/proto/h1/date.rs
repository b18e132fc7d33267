use std::cell::RefCell;
use std::time::{Duration, Instant, SystemTime};

use bytes::BytesMut;

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

/// Appends the current HTTP-date, re-rendered at most once per second.
pub(crate) fn extend(dst: &mut BytesMut) {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check();
        dst.extend_from_slice(cache.value.as_bytes());
    })
}

struct CachedDate {
    value: String,
    next_update: Instant,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> CachedDate {
        let mut cache = CachedDate {
            value: String::new(),
            next_update: Instant::now(),
        };
        cache.render();
        cache
    }

    fn check(&mut self) {
        if Instant::now() >= self.next_update {
            self.render();
        }
    }

    fn render(&mut self) {
        self.value = httpdate::fmt_http_date(SystemTime::now());
        debug_assert_eq!(self.value.len(), DATE_VALUE_LENGTH);
        self.next_update = Instant::now() + Duration::from_secs(1);
    }
}
