//! Executor slot tokens
//!
//! A counting semaphore handing out slot indices. Possessing a token is
//! the right to run one executor thread; tokens return when the thread
//! exits, so `taken + available = capacity` whenever the pool is quiet.

use std::sync::{Condvar, Mutex};

/// Fixed-capacity token pool
pub struct TokenPool {
    capacity: usize,
    state: Mutex<TokenState>,
    available: Condvar,
}

struct TokenState {
    free: Vec<usize>,
    closed: bool,
}

impl TokenPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(TokenState {
                free: (0..capacity).rev().collect(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a token, blocking while none are free. Returns `None` once the
    /// pool has been closed.
    pub fn acquire(&self) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return None;
            }
            if let Some(token) = state.free.pop() {
                return Some(token);
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Return a token to the pool
    pub fn release(&self, token: usize) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(token < self.capacity);
        debug_assert!(!state.free.contains(&token), "token {} double-released", token);
        state.free.push(token);
        self.available.notify_one();
    }

    /// Tokens currently held by executors
    pub fn taken(&self) -> usize {
        self.capacity - self.state.lock().unwrap().free.len()
    }

    pub fn available(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    /// Wake all waiters and make further acquires fail
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.available.notify_all();
    }

    /// Restore the pool to its initial, fully-available state
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.free = (0..self.capacity).rev().collect();
        state.closed = false;
        self.available.notify_all();
    }
}
