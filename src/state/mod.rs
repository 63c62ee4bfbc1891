//! Shared state store
//!
//! Backing store for memory snapshots and the distributed reduction
//! accumulator. The trait is the seam to an external key-value backend;
//! [`InMemoryStateStore`] backs the in-memory state mode, in which this
//! node also serves its state to peers over TCP (see [`server`]).
//!
//! Counter values are signed 64-bit, stored as 8 little-endian bytes.

pub mod server;

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Result type for state operations
pub type StateResult<T> = Result<T, StateError>;

/// Errors from the state backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Backend unreachable or refused the operation
    Unavailable { reason: String },
    /// Value exists but is not a valid counter
    BadCounter { key: String },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => {
                write!(f, "state backend unavailable: {}", reason)
            }
            Self::BadCounter { key } => {
                write!(f, "state key '{}' does not hold a counter", key)
            }
        }
    }
}

impl std::error::Error for StateError {}

/// Key-value operations the runtime needs from a state backend
pub trait StateStore: Send + Sync {
    fn set_bytes(&self, key: &str, value: &[u8]) -> StateResult<()>;
    fn get_bytes(&self, key: &str) -> StateResult<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> StateResult<()>;

    /// Store a signed 64-bit counter
    fn set_i64(&self, key: &str, value: i64) -> StateResult<()>;
    /// Read a counter; a missing key reads as 0
    fn get_i64(&self, key: &str) -> StateResult<i64>;
    /// Atomically add `by` to a counter, returning the new value
    fn incr_i64(&self, key: &str, by: i64) -> StateResult<i64>;

    /// Drop all local state (sharing-bus flush)
    fn clear(&self) -> StateResult<()>;

    /// Liveness check, run once at pool construction
    fn ping(&self) -> StateResult<()>;
}

/// Process-local state store over a mutexed map
pub struct InMemoryStateStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_i64(key: &str, bytes: &[u8]) -> StateResult<i64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| StateError::BadCounter {
        key: key.to_string(),
    })?;
    Ok(i64::from_le_bytes(arr))
}

impl StateStore for InMemoryStateStore {
    fn set_bytes(&self, key: &str, value: &[u8]) -> StateResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get_bytes(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn delete(&self, key: &str) -> StateResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn set_i64(&self, key: &str, value: i64) -> StateResult<()> {
        self.set_bytes(key, &value.to_le_bytes())
    }

    fn get_i64(&self, key: &str) -> StateResult<i64> {
        match self.entries.lock().unwrap().get(key) {
            Some(bytes) => decode_i64(key, bytes),
            None => Ok(0),
        }
    }

    fn incr_i64(&self, key: &str, by: i64) -> StateResult<i64> {
        let mut entries = self.entries.lock().unwrap();
        let current = match entries.get(key) {
            Some(bytes) => decode_i64(key, bytes)?,
            None => 0,
        };
        let next = current.wrapping_add(by);
        entries.insert(key.to_string(), next.to_le_bytes().to_vec());
        Ok(next)
    }

    fn clear(&self) -> StateResult<()> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    fn ping(&self) -> StateResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip() {
        let store = InMemoryStateStore::new();
        store.set_bytes("k", b"value").unwrap();
        assert_eq!(store.get_bytes("k").unwrap().unwrap(), b"value");
        store.delete("k").unwrap();
        assert_eq!(store.get_bytes("k").unwrap(), None);
    }

    #[test]
    fn test_counter_semantics() {
        let store = InMemoryStateStore::new();
        // Missing key reads as zero
        assert_eq!(store.get_i64("acc").unwrap(), 0);

        store.set_i64("acc", 5).unwrap();
        assert_eq!(store.incr_i64("acc", 7).unwrap(), 12);
        assert_eq!(store.get_i64("acc").unwrap(), 12);
        assert_eq!(store.incr_i64("acc", -2).unwrap(), 10);
    }

    #[test]
    fn test_bad_counter() {
        let store = InMemoryStateStore::new();
        store.set_bytes("acc", b"not a counter").unwrap();
        assert!(matches!(
            store.get_i64("acc"),
            Err(StateError::BadCounter { .. })
        ));
    }

    #[test]
    fn test_concurrent_increments() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryStateStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    store.incr_i64("acc", 1).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get_i64("acc").unwrap(), 800);
    }

    #[test]
    fn test_clear() {
        let store = InMemoryStateStore::new();
        store.set_bytes("a", b"1").unwrap();
        store.set_i64("b", 2).unwrap();
        store.clear().unwrap();
        assert_eq!(store.get_bytes("a").unwrap(), None);
        assert_eq!(store.get_i64("b").unwrap(), 0);
    }
}
