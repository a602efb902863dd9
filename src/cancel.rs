//! Caller-driven cancellation.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::debug;

/// A handle to abort an in-flight call.
///
/// Cloning shares the token. [`CancelToken::cancel`] aborts blocked socket
/// operations (by shutting the sockets down), interrupts retry backoff
/// sleeps and pool waits, and makes the call fail with
/// [`Error::Canceled`][crate::Error::Canceled]. A connection in use by a
/// canceled call is marked broken and never returns to the pool.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    canceled: AtomicBool,
    sockets: Mutex<Vec<Option<TcpStream>>>,
    sleep_lock: Mutex<()>,
    sleep_cond: Condvar,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Abort the call(s) using this token.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);

        let sockets = self.inner.sockets.lock().unwrap();
        for s in sockets.iter().flatten() {
            debug!("cancel: shutting down in-flight socket");
            let _ = s.shutdown(Shutdown::Both);
        }

        self.inner.sleep_cond.notify_all();
    }

    /// Whether the token has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Register a socket so `cancel()` can abort blocked I/O on it.
    /// Returns a slot id for [`CancelToken::unregister`].
    pub(crate) fn register(&self, socket: &TcpStream) -> Option<usize> {
        let clone = socket.try_clone().ok()?;
        let mut sockets = self.inner.sockets.lock().unwrap();

        if self.is_canceled() {
            let _ = clone.shutdown(Shutdown::Both);
        }

        sockets.push(Some(clone));
        Some(sockets.len() - 1)
    }

    pub(crate) fn unregister(&self, slot: Option<usize>) {
        if let Some(slot) = slot {
            let mut sockets = self.inner.sockets.lock().unwrap();
            if let Some(entry) = sockets.get_mut(slot) {
                *entry = None;
            }
        }
    }

    /// Sleep that wakes early on cancel. Returns `false` when canceled.
    pub(crate) fn sleep(&self, dur: Duration) -> bool {
        let guard = self.inner.sleep_lock.lock().unwrap();
        let (_guard, _timeout) = self
            .inner
            .sleep_cond
            .wait_timeout_while(guard, dur, |_| !self.is_canceled())
            .unwrap();
        !self.is_canceled()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CancelToken(canceled: {})", self.is_canceled())
    }
}

/// Sleep through the token when present, plainly otherwise. Returns
/// `false` when the sleep was interrupted by cancellation.
pub(crate) fn sleep(token: Option<&CancelToken>, dur: Duration) -> bool {
    match token {
        Some(t) => t.sleep(dur),
        None => {
            std::thread::sleep(dur);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn sleep_interrupted_by_cancel() {
        let token = CancelToken::new();
        let t2 = token.clone();

        let start = Instant::now();
        let h = std::thread::spawn(move || t2.sleep(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(50));
        token.cancel();

        assert!(!h.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(token.is_canceled());
    }

    #[test]
    fn register_after_cancel_shuts_down() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = TcpStream::connect(addr).unwrap();

        let token = CancelToken::new();
        token.cancel();
        let slot = token.register(&socket);

        // The blocked read unblocks immediately because the socket was
        // shut down at registration time.
        let mut buf = [0u8; 1];
        use std::io::Read;
        let r = (&socket).read(&mut buf);
        assert!(matches!(r, Ok(0) | Err(_)));

        token.unregister(slot);
    }
}
