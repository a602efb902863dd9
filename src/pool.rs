//! Keyed connection pool with concurrency and lifetime bounds.
//!
//! Connections are pooled per origin `(scheme, host, port)`. Acquisition
//! respects a per-host and a global limit; when both are exhausted the
//! caller waits in FIFO order on a condvar, bounded by the connect
//! deadline. A background sweeper closes connections idle past their TTL.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use log::{debug, trace};

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::transport::{Connection, HostKey, ReadHalf, WriteHalf};
use crate::util::Deadline;

/// Pool behavior knobs, taken from the agent configuration.
#[derive(Debug, Clone)]
pub(crate) struct PoolLimits {
    pub connection_limit: usize,
    pub connection_limit_per_host: usize,
    pub idle_timeout: Duration,
    pub max_requests_per_connection: u64,
}

/// Granularity of the FIFO wait loop; each slice re-checks cancellation.
const WAIT_SLICE: Duration = Duration::from_millis(100);

pub(crate) struct Pool {
    shared: Arc<Shared>,
}

struct Shared {
    limits: PoolLimits,
    state: Mutex<State>,
    available: Condvar,
}

#[derive(Default)]
struct State {
    hosts: HashMap<HostKey, HostEntry>,
    /// All live connections, idle and busy, across every host.
    total: usize,
    next_ticket: u64,
    sweeper_running: bool,
}

#[derive(Default)]
struct HostEntry {
    idle: VecDeque<Connection>,
    busy: usize,
    waiters: VecDeque<u64>,
}

impl HostEntry {
    fn live(&self) -> usize {
        self.idle.len() + self.busy
    }
}

impl Pool {
    pub fn new(limits: PoolLimits) -> Pool {
        Pool {
            shared: Arc::new(Shared {
                limits,
                state: Mutex::new(State::default()),
                available: Condvar::new(),
            }),
        }
    }

    /// Lease a connection for one exchange: an idle healthy one when
    /// available, a fresh one while limits allow, otherwise wait in line
    /// until `deadline` and fail with [`Error::ConnectTimeout`].
    pub fn acquire(
        &self,
        key: &HostKey,
        verify_tls: bool,
        deadline: Deadline,
        cancel: Option<&CancelToken>,
    ) -> Result<Transaction, Error> {
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();
        let mut my_ticket: Option<u64> = None;

        loop {
            if cancel.is_some_and(|c| c.is_canceled()) {
                remove_ticket(&mut state, key, my_ticket);
                return Err(Error::Canceled);
            }

            let first_in_line = {
                let entry = state.hosts.entry(key.clone()).or_default();
                match my_ticket {
                    Some(t) => entry.waiters.front() == Some(&t),
                    None => entry.waiters.is_empty(),
                }
            };

            if first_in_line {
                // Prefer reusing an idle connection. Unhealthy candidates
                // are discarded and the next tried.
                loop {
                    let candidate = state
                        .hosts
                        .get_mut(key)
                        .and_then(|e| e.idle.pop_front());
                    let Some(conn) = candidate else {
                        break;
                    };

                    if conn.probe_healthy() {
                        let entry = state.hosts.get_mut(key).unwrap();
                        entry.busy += 1;
                        remove_ticket(&mut state, key, my_ticket);
                        shared.available.notify_all();
                        drop(state);

                        trace!("pool reuse {} (seq {})", key, conn.sequence());
                        return Ok(self.lease(conn));
                    }

                    debug!("pool discarding dead idle connection for {}", key);
                    state.total -= 1;
                    conn.close();
                }

                // No idle connection; open a new one while limits allow.
                let can_open = {
                    let s = &mut *state;
                    let entry = s.hosts.entry(key.clone()).or_default();
                    entry.live() < shared.limits.connection_limit_per_host
                        && s.total < shared.limits.connection_limit
                };
                if can_open {
                    state.hosts.get_mut(key).unwrap().busy += 1;
                    state.total += 1;
                    remove_ticket(&mut state, key, my_ticket);
                    shared.available.notify_all();
                    drop(state);

                    // Connecting happens outside the lock; the slot is
                    // already reserved.
                    match Connection::connect(key, verify_tls, deadline) {
                        Ok(conn) => return Ok(self.lease(conn)),
                        Err(e) => {
                            let mut state = shared.state.lock().unwrap();
                            let entry = state.hosts.get_mut(key).unwrap();
                            entry.busy -= 1;
                            state.total -= 1;
                            shared.available.notify_all();
                            return Err(e);
                        }
                    }
                }
            }

            // Both limits exhausted (or someone is ahead of us): wait.
            if my_ticket.is_none() {
                let t = state.next_ticket;
                state.next_ticket += 1;
                state.hosts.get_mut(key).unwrap().waiters.push_back(t);
                my_ticket = Some(t);
                trace!("pool wait on {} (ticket {})", key, t);
            }

            let Some(remaining) = deadline.remaining() else {
                let (s, _) = shared.available.wait_timeout(state, WAIT_SLICE).unwrap();
                state = s;
                continue;
            };

            if remaining.is_zero() {
                remove_ticket(&mut state, key, my_ticket);
                shared.available.notify_all();
                return Err(Error::ConnectTimeout);
            }

            let (s, _) = shared
                .available
                .wait_timeout(state, remaining.min(WAIT_SLICE))
                .unwrap();
            state = s;
        }
    }

    fn lease(&self, mut conn: Connection) -> Transaction {
        conn.bump_sequence();
        Transaction {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Close every idle connection. In-flight leases are unaffected and
    /// released normally.
    pub fn close_all(&self) {
        let mut state = self.shared.state.lock().unwrap();
        let mut closed = Vec::new();
        for entry in state.hosts.values_mut() {
            closed.extend(entry.idle.drain(..));
        }
        state.total -= closed.len();
        drop(state);

        debug!("pool close_all: {} idle connections closed", closed.len());
        for conn in closed {
            conn.close();
        }
        self.shared.available.notify_all();
    }

    #[cfg(test)]
    pub fn idle_count(&self, key: &HostKey) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.hosts.get(key).map(|e| e.idle.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn total(&self) -> usize {
        self.shared.state.lock().unwrap().total
    }
}

fn remove_ticket(state: &mut State, key: &HostKey, ticket: Option<u64>) {
    if let Some(t) = ticket {
        if let Some(entry) = state.hosts.get_mut(key) {
            entry.waiters.retain(|w| *w != t);
        }
    }
}

/// A scoped lease on a [`Connection`] for exactly one request/response
/// exchange. Dropping without [`Transaction::finish`] counts as an error
/// path: the connection is closed, not pooled.
pub(crate) struct Transaction {
    conn: Option<Connection>,
    shared: Arc<Shared>,
}

impl Transaction {
    pub fn split(&self) -> (ReadHalf<'_>, WriteHalf<'_>) {
        self.conn().split()
    }

    pub fn conn(&self) -> &Connection {
        self.conn.as_ref().unwrap()
    }

    pub fn sequence(&self) -> u64 {
        self.conn().sequence()
    }

    pub fn mark_broken(&mut self) {
        if let Some(c) = self.conn.as_mut() {
            c.mark_broken();
        }
    }

    /// End the lease. With `reuse` the connection goes back to the idle
    /// set (subject to health and lifetime bounds), otherwise it closes.
    pub fn finish(mut self, reuse: bool) {
        let conn = self.conn.take().unwrap();
        release(&self.shared, conn, reuse);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.mark_broken();
            release(&self.shared, conn, false);
        }
    }
}

fn release(shared: &Arc<Shared>, mut conn: Connection, reuse: bool) {
    let mut state = shared.state.lock().unwrap();

    let entry = state.hosts.entry(conn.key().clone()).or_default();
    entry.busy = entry.busy.saturating_sub(1);

    let keep = reuse
        && !conn.is_broken()
        && conn.sequence() < shared.limits.max_requests_per_connection;

    if keep {
        trace!("pool keep {} (seq {})", conn.key(), conn.sequence());
        conn.touch();
        entry.idle.push_back(conn);
        maybe_spawn_sweeper(shared, &mut state);
    } else {
        trace!("pool close {} on release", conn.key());
        state.total -= 1;
        drop(state);
        conn.close();
        shared.available.notify_all();
        return;
    }

    drop(state);
    shared.available.notify_all();
}

fn maybe_spawn_sweeper(shared: &Arc<Shared>, state: &mut State) {
    if state.sweeper_running {
        return;
    }

    let weak = Arc::downgrade(shared);
    let spawned = std::thread::Builder::new()
        .name("reqflow-pool-sweeper".into())
        .spawn(move || sweeper_loop(weak))
        .is_ok();

    state.sweeper_running = spawned;
}

/// Closes idle connections older than the idle timeout. Exits when the
/// pool is dropped.
fn sweeper_loop(weak: Weak<Shared>) {
    loop {
        let interval = match weak.upgrade() {
            Some(shared) => (shared.limits.idle_timeout / 2)
                .clamp(Duration::from_millis(50), Duration::from_secs(5)),
            None => return,
        };
        std::thread::sleep(interval);

        let Some(shared) = weak.upgrade() else {
            return;
        };

        let mut state = shared.state.lock().unwrap();
        let timeout = shared.limits.idle_timeout;
        let mut evicted = Vec::new();

        for entry in state.hosts.values_mut() {
            while entry
                .idle
                .front()
                .is_some_and(|c| c.idle_since().elapsed() >= timeout)
            {
                evicted.push(entry.idle.pop_front().unwrap());
            }
        }
        state.total -= evicted.len();
        drop(state);

        if !evicted.is_empty() {
            debug!("pool sweeper evicting {} idle connections", evicted.len());
            for conn in evicted {
                conn.close();
            }
            shared.available.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HostScheme;
    use std::net::TcpListener;
    use std::time::Instant;

    fn limits() -> PoolLimits {
        PoolLimits {
            connection_limit: 64,
            connection_limit_per_host: 8,
            idle_timeout: Duration::from_secs(30),
            max_requests_per_connection: 1000,
        }
    }

    fn local_server() -> (TcpListener, HostKey) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let key = HostKey {
            scheme: HostScheme::Http,
            host: "127.0.0.1".into(),
            port: listener.local_addr().unwrap().port(),
        };
        (listener, key)
    }

    fn deadline() -> Deadline {
        Deadline::after(Some(Duration::from_secs(5)))
    }

    #[test]
    fn acquire_release_reuse() {
        let (listener, key) = local_server();
        let accepter = std::thread::spawn(move || {
            let mut held = Vec::new();
            while let Ok((s, _)) = listener.accept() {
                held.push(s);
                if held.len() == 1 {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(500));
            held
        });

        let pool = Pool::new(limits());

        let tx = pool.acquire(&key, true, deadline(), None).unwrap();
        assert_eq!(tx.sequence(), 1);
        tx.finish(true);
        assert_eq!(pool.idle_count(&key), 1);

        // The same connection comes back with a bumped sequence.
        let tx = pool.acquire(&key, true, deadline(), None).unwrap();
        assert_eq!(tx.sequence(), 2);
        tx.finish(true);

        assert_eq!(pool.total(), 1);
        drop(pool);
        accepter.join().unwrap();
    }

    #[test]
    fn broken_connection_not_pooled() {
        let (listener, key) = local_server();
        let accepter = std::thread::spawn(move || listener.accept().unwrap());

        let pool = Pool::new(limits());
        let mut tx = pool.acquire(&key, true, deadline(), None).unwrap();
        tx.mark_broken();
        tx.finish(true);

        assert_eq!(pool.idle_count(&key), 0);
        assert_eq!(pool.total(), 0);
        drop(accepter.join().unwrap());
    }

    #[test]
    fn drop_without_finish_closes() {
        let (listener, key) = local_server();
        let accepter = std::thread::spawn(move || listener.accept().unwrap());

        let pool = Pool::new(limits());
        let tx = pool.acquire(&key, true, deadline(), None).unwrap();
        drop(tx);

        assert_eq!(pool.total(), 0);
        drop(accepter.join().unwrap());
    }

    #[test]
    fn per_host_limit_blocks_until_release() {
        let (listener, key) = local_server();
        let accepter = std::thread::spawn(move || {
            let mut held = Vec::new();
            for _ in 0..2 {
                if let Ok((s, _)) = listener.accept() {
                    held.push(s);
                }
            }
            std::thread::sleep(Duration::from_secs(2));
            held
        });

        let mut l = limits();
        l.connection_limit_per_host = 2;
        let pool = Arc::new(Pool::new(l));

        let tx1 = pool.acquire(&key, true, deadline(), None).unwrap();
        let tx2 = pool.acquire(&key, true, deadline(), None).unwrap();

        // Third acquire must wait for a release.
        let p2 = Arc::clone(&pool);
        let k2 = key.clone();
        let start = Instant::now();
        let waiter = std::thread::spawn(move || {
            let tx = p2.acquire(&k2, true, deadline(), None).unwrap();
            let waited = start.elapsed();
            tx.finish(true);
            waited
        });

        std::thread::sleep(Duration::from_millis(200));
        tx1.finish(true);
        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(150), "waited {:?}", waited);

        tx2.finish(true);
        assert!(pool.total() <= 2);
        accepter.join().unwrap();
    }

    #[test]
    fn acquire_times_out_when_exhausted() {
        let (listener, key) = local_server();
        let accepter = std::thread::spawn(move || {
            let held = listener.accept().unwrap();
            std::thread::sleep(Duration::from_secs(1));
            held
        });

        let mut l = limits();
        l.connection_limit_per_host = 1;
        let pool = Pool::new(l);

        let _tx = pool.acquire(&key, true, deadline(), None).unwrap();

        let start = Instant::now();
        let r = pool.acquire(
            &key,
            true,
            Deadline::after(Some(Duration::from_millis(300))),
            None,
        );
        assert!(matches!(r, Err(Error::ConnectTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(250));

        drop(accepter.join().unwrap());
    }

    #[test]
    fn max_requests_retires_connection() {
        let (listener, key) = local_server();
        let accepter = std::thread::spawn(move || {
            let mut held = Vec::new();
            for _ in 0..2 {
                if let Ok((s, _)) = listener.accept() {
                    held.push(s);
                }
            }
            held
        });

        let mut l = limits();
        l.max_requests_per_connection = 1;
        let pool = Pool::new(l);

        let tx = pool.acquire(&key, true, deadline(), None).unwrap();
        tx.finish(true);
        // Sequence reached the cap: the connection was closed.
        assert_eq!(pool.idle_count(&key), 0);

        let tx = pool.acquire(&key, true, deadline(), None).unwrap();
        assert_eq!(tx.sequence(), 1);
        tx.finish(false);
        accepter.join().unwrap();
    }

    #[test]
    fn sweeper_evicts_idle_connections() {
        let (listener, key) = local_server();
        let accepter = std::thread::spawn(move || listener.accept().unwrap());

        let mut l = limits();
        l.idle_timeout = Duration::from_millis(100);
        let pool = Pool::new(l);

        let tx = pool.acquire(&key, true, deadline(), None).unwrap();
        tx.finish(true);
        assert_eq!(pool.idle_count(&key), 1);

        // Sweeper interval is idle_timeout / 2 (clamped to 50ms).
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(pool.idle_count(&key), 0);
        assert_eq!(pool.total(), 0);
        drop(accepter.join().unwrap());
    }

    #[test]
    fn close_all_drains_idle() {
        let (listener, key) = local_server();
        let accepter = std::thread::spawn(move || listener.accept().unwrap());

        let pool = Pool::new(limits());
        let tx = pool.acquire(&key, true, deadline(), None).unwrap();
        tx.finish(true);
        assert_eq!(pool.idle_count(&key), 1);

        pool.close_all();
        assert_eq!(pool.idle_count(&key), 0);
        assert_eq!(pool.total(), 0);
        drop(accepter.join().unwrap());
    }
}
