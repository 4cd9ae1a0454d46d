//! Store wrapper that injects upload and verification failures.
use crate::store::ObjectStore;
use async_trait::async_trait;
use devenv_core::{DevEnvError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Faults {
    failing_puts: AtomicUsize,
    corrupt_heads: AtomicUsize,
    puts: AtomicUsize,
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Clone)]
pub struct FaultyStore<S> {
    inner: S,
    faults: Arc<Faults>,
}

impl<S: ObjectStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The next `n` puts fail with a transient error before storing anything.
    pub fn fail_puts(&self, n: usize) {
        self.faults.failing_puts.store(n, Ordering::SeqCst);
    }

    /// The next `n` heads report a hash that matches nothing.
    pub fn corrupt_heads(&self, n: usize) {
        self.faults.corrupt_heads.store(n, Ordering::SeqCst);
    }

    /// Puts that reached the inner store.
    pub fn put_count(&self) -> usize {
        self.faults.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for FaultyStore<S> {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        if take(&self.faults.failing_puts) {
            return Err(DevEnvError::transient(format!("injected upload failure for {key}")));
        }
        self.faults.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, bytes).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn head(&self, key: &str) -> Result<Option<String>> {
        if take(&self.faults.corrupt_heads) {
            return Ok(Some("0".repeat(64)));
        }
        self.inner.head(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
}
