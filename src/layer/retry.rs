//! Re-issue requests on classified recoverable failures.
//!
//! Recoverable means a transport-level error, or a response status in
//! {403, 408, 5xx}. Either way a retry only happens when the request body
//! is still replayable, no response bytes have reached the caller, and
//! the method is idempotent (unless `retry_non_idempotent`). The layer
//! sits above the pool, so every attempt acquires a fresh (or
//! re-validated) connection.

use std::time::Duration;

use log::debug;

use crate::cancel;
use crate::error::{retryable_status, Error};
use crate::ext::MethodExt;
use crate::layer::{Call, Layer, Next};
use crate::response::Response;

pub(crate) struct RetryLayer {
    pub retries: u32,
    pub retry_non_idempotent: bool,
    pub backoff_base: Duration,
    pub backoff_factor: u32,
}

impl Layer for RetryLayer {
    fn handle(&self, call: &mut Call<'_>, next: Next<'_>) -> Result<Response, Error> {
        let mut backoff = Backoff::new(self.backoff_base, self.backoff_factor);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = next.run(call);

            let recoverable = match &result {
                Ok(response) => retryable_status(response.status().as_u16()),
                Err(e) => e.is_recoverable(),
            };

            if !recoverable
                || attempt > self.retries
                || !call.body.is_replayable()
                || call.sink_touched
                || !(call.method.is_idempotent() || self.retry_non_idempotent)
                || call.deadline.is_expired()
            {
                return result;
            }

            let delay = backoff.next().unwrap_or(self.backoff_base);
            debug!(
                "attempt {} of {} failed, retrying in {:?}",
                attempt,
                self.retries + 1,
                delay
            );

            // Keep the failed attempt in the history chain when there is
            // a response to take it from; the next attempt starts with a
            // reset response either way.
            match result {
                Ok(response) => call.history = Some(Box::new(response.take_request())),
                Err(Error::Status { response, .. }) => {
                    call.history = Some(Box::new(response.take_request()))
                }
                Err(_) => {}
            }

            if !cancel::sleep(call.opts.cancel.as_ref(), call.deadline.cap(delay)) {
                return Err(Error::Canceled);
            }
        }
    }
}

/// Exponential backoff: base, base×factor, base×factor², …
pub(crate) struct Backoff {
    next: Duration,
    factor: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: u32) -> Backoff {
        Backoff { next: base, factor }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.next;
        self.next = delay.saturating_mul(self.factor);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule() {
        let delays: Vec<_> = Backoff::new(Duration::from_secs(1), 10).take(3).collect();
        assert_eq!(
            delays,
            [
                Duration::from_secs(1),
                Duration::from_secs(10),
                Duration::from_secs(100)
            ]
        );
    }

    #[test]
    fn backoff_saturates() {
        let mut b = Backoff::new(Duration::MAX, 10);
        assert_eq!(b.next(), Some(Duration::MAX));
        assert_eq!(b.next(), Some(Duration::MAX));
    }
}
