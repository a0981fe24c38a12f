//! In-memory store and data provider for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::provider::{CollectionSpec, DataProvider};
use crate::store::KeyValueStore;
use fieldkeep_common::{CollectionName, Error, Payload, Result};

/// In-memory key-value store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    failing_puts: AtomicU32,
    failing_keys: RwLock<HashMap<String, u32>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cause the next `count` calls to `put` to fail.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Cause the next `count` calls to `put` on `key` to fail.
    pub fn fail_puts_to(&self, key: &str, count: u32) {
        let mut failing = self.failing_keys.write().unwrap_or_else(PoisonError::into_inner);
        failing.insert(key.to_string(), count);
    }

    fn take_key_failure(&self, key: &str) -> bool {
        let mut failing = self.failing_keys.write().unwrap_or_else(PoisonError::into_inner);
        match failing.get_mut(key) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    /// Keys currently holding a value.
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let injected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
            || self.take_key_failure(key);
        if injected {
            return Err(Error::Storage(format!("Injected write failure for {}", key)));
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// In-memory data provider.
///
/// Holds the application collections in a single map that is swapped as a
/// whole on `write_all`, so writes are all-or-nothing.
#[derive(Debug)]
pub struct MemoryDataProvider {
    required: Vec<CollectionSpec>,
    state: RwLock<Payload>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryDataProvider {
    /// Create a provider whose required collections start out empty.
    pub fn new(required: Vec<CollectionSpec>) -> Self {
        let state = required
            .iter()
            .map(|spec| (spec.name.clone(), spec.shape.empty()))
            .collect();

        Self {
            required,
            state: RwLock::new(state),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Replace a single collection.
    pub fn set_collection(&self, name: CollectionName, records: serde_json::Value) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.insert(name, records);
    }

    /// Remove a collection entirely.
    pub fn remove_collection(&self, name: &CollectionName) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.remove(name);
    }

    /// Copy of the current state.
    pub fn payload(&self) -> Payload {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make reads fail until switched back.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make writes fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataProvider for MemoryDataProvider {
    fn required_collections(&self) -> Vec<CollectionSpec> {
        self.required.clone()
    }

    async fn read_all(&self) -> Result<Payload> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::ProviderUnavailable(
                "memory provider is not readable".to_string(),
            ));
        }
        Ok(self.payload())
    }

    async fn write_all(&self, payload: Payload) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::ProviderUnavailable(
                "memory provider is not writable".to_string(),
            ));
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = payload;
        Ok(())
    }
}
