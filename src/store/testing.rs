//! Store doubles for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Consumption, LogAdmission, MemoryStore, Store, StoreError, StoreHit};
use crate::clock::Clock;

/// Wraps a [`MemoryStore`] and counts every call that can mutate state.
#[derive(Debug)]
pub(crate) struct CountingStore {
    inner: MemoryStore,
    mutations: AtomicUsize,
}

impl CountingStore {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: MemoryStore::with_clock(clock),
            mutations: AtomicUsize::new(0),
        }
    }

    pub(crate) fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        cost: u64,
    ) -> Result<StoreHit, StoreError> {
        self.bump();
        self.inner.increment(key, window, cost).await
    }

    async fn consume(
        &self,
        key: &str,
        window: Duration,
        cost: u64,
        limit: u64,
    ) -> Result<Consumption, StoreError> {
        self.bump();
        self.inner.consume(key, window, cost, limit).await
    }

    async fn record(
        &self,
        key: &str,
        window: Duration,
        cost: u64,
        limit: u64,
        now_ms: i64,
    ) -> Result<LogAdmission, StoreError> {
        self.bump();
        self.inner.record(key, window, cost, limit, now_ms).await
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.inner.get(key).await
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.bump();
        self.inner.reset(key).await
    }
}

/// A store whose backend is always down.
#[derive(Debug, Default)]
pub(crate) struct FailingStore;

impl FailingStore {
    fn down() -> StoreError {
        StoreError::Unavailable("connection refused".to_string())
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn increment(&self, _: &str, _: Duration, _: u64) -> Result<StoreHit, StoreError> {
        Err(Self::down())
    }

    async fn consume(
        &self,
        _: &str,
        _: Duration,
        _: u64,
        _: u64,
    ) -> Result<Consumption, StoreError> {
        Err(Self::down())
    }

    async fn record(
        &self,
        _: &str,
        _: Duration,
        _: u64,
        _: u64,
        _: i64,
    ) -> Result<LogAdmission, StoreError> {
        Err(Self::down())
    }

    async fn get(&self, _: &str) -> Result<Option<u64>, StoreError> {
        Err(Self::down())
    }

    async fn reset(&self, _: &str) -> Result<(), StoreError> {
        Err(Self::down())
    }
}
