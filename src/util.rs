//! Small helpers shared across the crate.

use std::fmt;
use std::io;
use std::io::Write as _;
use std::time::{Duration, Instant};

use log::trace;

/// Incremental writer over a borrowed output buffer.
///
/// Writes either succeed completely or roll back, which is what the
/// serialization code needs to emit whole header rows at a time.
pub(crate) struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Writer<'a> {
        Writer { buf, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Run a write closure against the remaining buffer. If the closure
    /// overflows the buffer, nothing is committed and `false` is returned.
    pub fn try_write<F: FnOnce(&mut CheckedWrite<'_>) -> io::Result<()>>(&mut self, f: F) -> bool {
        let mut w = CheckedWrite {
            buf: &mut self.buf[self.pos..],
            pos: 0,
            overflow: false,
        };

        if f(&mut w).is_err() || w.overflow {
            return false;
        }

        self.pos += w.pos;
        true
    }

    /// Copy as many bytes as fit, returning the amount copied.
    pub fn write_bytes(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available());
        self.buf[self.pos..self.pos + n].copy_from_slice(&data[..n]);
        self.pos += n;
        n
    }
}

pub(crate) struct CheckedWrite<'a> {
    buf: &'a mut [u8],
    pos: usize,
    overflow: bool,
}

impl io::Write for CheckedWrite<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.pos + data.len() > self.buf.len() {
            self.overflow = true;
            return Err(io::ErrorKind::WriteZero.into());
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Write for CheckedWrite<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

const MAX_LOG_DATA: usize = 2048;

/// Tee wire bytes to the log. Used by the debug layer; never alters data.
pub(crate) fn log_data(direction: &'static str, data: &[u8]) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }

    let (shown, suffix) = if data.len() > MAX_LOG_DATA {
        (&data[..MAX_LOG_DATA], " (truncated)")
    } else {
        (data, "")
    };

    trace!(
        "{} {} bytes: {:?}{}",
        direction,
        data.len(),
        String::from_utf8_lossy(shown),
        suffix
    );
}

/// Render a lowercase header name in `Canonical-Kebab` casing.
///
/// `http::HeaderName` stores names lowercased, so canonical casing is a
/// serialization concern.
pub(crate) fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

/// An optional absolute deadline, propagated through a call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn after(d: Option<Duration>) -> Deadline {
        Deadline {
            at: d.map(|d| Instant::now() + d),
        }
    }

    /// Time left, or `None` for no deadline. `Some(ZERO)` means expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// The smaller of `d` and the remaining time.
    pub fn cap(&self, d: Duration) -> Duration {
        match self.remaining() {
            Some(r) => d.min(r),
            None => d,
        }
    }

    /// Cap an optional duration; `None` means unbounded on both sides.
    pub fn cap_opt(&self, d: Option<Duration>) -> Option<Duration> {
        match (d, self.remaining()) {
            (Some(d), Some(r)) => Some(d.min(r)),
            (Some(d), None) => Some(d),
            (None, r) => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn writer_commits_whole_rows() {
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);

        assert!(w.try_write(|w| write!(w, "0123456789")));
        assert_eq!(w.len(), 10);

        // Does not fit: nothing is committed.
        assert!(!w.try_write(|w| write!(w, "0123456789")));
        assert_eq!(w.len(), 10);

        assert!(w.try_write(|w| write!(w, "012345")));
        assert_eq!(w.len(), 16);
        assert_eq!(&buf, b"0123456789012345");
    }

    #[test]
    fn writer_partial_bytes() {
        let mut buf = [0u8; 4];
        let mut w = Writer::new(&mut buf);
        assert_eq!(w.write_bytes(b"abcdef"), 4);
        assert_eq!(w.available(), 0);
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn canonical_header_casing() {
        assert_eq!(canonical_name("content-type"), "Content-Type");
        assert_eq!(canonical_name("host"), "Host");
        assert_eq!(canonical_name("x-amz-date"), "X-Amz-Date");
        assert_eq!(canonical_name("te"), "Te");
    }

    #[test]
    fn deadline_caps() {
        let d = Deadline::after(None);
        assert_eq!(d.cap(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(d.cap_opt(None), None);

        let d = Deadline::after(Some(Duration::from_secs(60)));
        assert_eq!(d.cap(Duration::from_secs(5)), Duration::from_secs(5));
        assert!(d.cap_opt(None).is_some());
        assert!(!d.is_expired());
    }
}
