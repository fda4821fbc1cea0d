//! Admission semaphore: bounds the number of concurrent in-flight
//! requests one operator instance may have posted to the driver.
//! Acquiring may park the calling thread — a real kernel block, not a
//! suspension on a language runtime.
//!
//! Built on `crossbeam-channel`'s bounded channel as a token pool: the
//! channel is pre-filled with `capacity` tokens at construction,
//! `acquire` blocks on `recv_timeout` for one, and the returned
//! [`AdmissionPermit`] returns its token to the channel on `Drop` —
//! released on every exit path including a panic unwinding through an
//! in-flight request.

use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::error::{Error, Result};

/// Bounds concurrent in-flight requests to `capacity`
/// (`max_in_flight = (any dynamic batch axis ? 4 : 1)`).
pub struct AdmissionSemaphore {
    capacity: usize,
    timeout: Duration,
    tokens_tx: Sender<()>,
    tokens_rx: Receiver<()>,
}

impl AdmissionSemaphore {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        let (tokens_tx, tokens_rx) = bounded(capacity);
        for _ in 0..capacity {
            let _ = tokens_tx.send(());
        }
        Self { capacity, timeout, tokens_tx, tokens_rx }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until a permit is free or `timeout` elapses.
    pub fn acquire(&self) -> Result<AdmissionPermit<'_>> {
        self.tokens_rx
            .recv_timeout(self.timeout)
            .map(|_| AdmissionPermit { sem: self })
            .map_err(|_| Error::ResourceExhausted("admission semaphore timed out waiting for a free slot".into()))
    }
}

/// RAII reservation; returns its token to the pool on drop regardless of
/// whether the reserved request succeeded, failed, or the holder panicked.
pub struct AdmissionPermit<'a> {
    sem: &'a AdmissionSemaphore,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        let _ = self.sem.tokens_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn bounds_outstanding_permits_to_capacity() {
        let sem = Arc::new(AdmissionSemaphore::new(2, Duration::from_millis(200)));
        let p1 = sem.acquire().unwrap();
        let p2 = sem.acquire().unwrap();
        let err = sem.acquire().unwrap_err();
        assert_eq!(err.kind(), "RESOURCE_EXHAUSTED");
        drop(p1);
        drop(p2);
    }

    #[test]
    fn releasing_a_permit_admits_the_next_waiter() {
        let sem = Arc::new(AdmissionSemaphore::new(1, Duration::from_secs(5)));
        let permit = sem.acquire().unwrap();

        let sem2 = sem.clone();
        let waiter = thread::spawn(move || sem2.acquire().is_ok());

        thread::sleep(Duration::from_millis(50));
        drop(permit);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn capacity_is_reported() {
        let sem = AdmissionSemaphore::new(4, Duration::from_secs(1));
        assert_eq!(sem.capacity(), 4);
    }
}
