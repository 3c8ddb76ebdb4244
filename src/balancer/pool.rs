//! Backend Pool
//!
//! Round-robin selection over an ordered backend set. Every pool owns its
//! cursor, so independent load balancers never advance each other's rotation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Backend, BalancerError};

/// Ordered backend set with a round-robin cursor
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Backend>,
    /// Index of the next backend to hand out, always below `backends.len()`
    cursor: AtomicUsize,
}

impl BackendPool {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Return the backend following the previously returned one.
    ///
    /// The first call returns index 0; after the last index the rotation
    /// wraps back to 0.
    pub fn next_backend(&self) -> Result<SocketAddr, BalancerError> {
        if self.backends.is_empty() {
            return Err(BalancerError::NoBackends);
        }
        let index = self.advance();
        Ok(self.backends[index].address)
    }

    /// Claim the current cursor position and move it one step, wrapping at the
    /// pool length.
    pub fn next_index(&self) -> Result<usize, BalancerError> {
        if self.backends.is_empty() {
            return Err(BalancerError::NoBackends);
        }
        Ok(self.advance())
    }

    /// Address of the backend at `index`, wrapping past the end
    pub fn address_at(&self, index: usize) -> Option<SocketAddr> {
        if self.backends.is_empty() {
            return None;
        }
        Some(self.backends[index % self.backends.len()].address)
    }

    fn advance(&self) -> usize {
        let len = self.backends.len();
        // The closure always returns Some, so both arms carry the previous value
        match self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some((c + 1) % len))
        {
            Ok(previous) | Err(previous) => previous,
        }
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
