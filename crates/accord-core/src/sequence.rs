//! Monotonic sequence allocation via row-locked counters (R9).
//!
//! A sequence number is never derived from `MAX(seq) + 1` over existing rows —
//! concurrent posters would race and collide. Instead each named counter lives in
//! its own row, locked with `SELECT ... FOR UPDATE` before being incremented in the
//! same transaction as the row that consumes it.

use crate::error::Error;
use async_trait::async_trait;

/// Storage-facing contract for counter allocation. Implementations must take the
/// row lock and the increment inside the same transaction `tx` the caller is
/// already holding, so the allocated number and the row that uses it commit or
/// abort together.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn lock_and_increment(&self, counter_name: &str) -> Result<i64, Error>;
    async fn peek(&self, counter_name: &str) -> Result<i64, Error>;
}

#[async_trait]
impl<T: SequenceStore + ?Sized> SequenceStore for std::sync::Arc<T> {
    async fn lock_and_increment(&self, counter_name: &str) -> Result<i64, Error> {
        (**self).lock_and_increment(counter_name).await
    }

    async fn peek(&self, counter_name: &str) -> Result<i64, Error> {
        (**self).peek(counter_name).await
    }
}

#[async_trait]
impl<'x, T: SequenceStore + ?Sized> SequenceStore for &'x T {
    async fn lock_and_increment(&self, counter_name: &str) -> Result<i64, Error> {
        (**self).lock_and_increment(counter_name).await
    }

    async fn peek(&self, counter_name: &str) -> Result<i64, Error> {
        (**self).peek(counter_name).await
    }
}

pub struct SequenceService<S: SequenceStore> {
    store: S,
}

impl<S: SequenceStore> SequenceService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Allocates the next value for `counter_name`, taking the row lock for the
    /// duration of the caller's transaction.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn next(&self, counter_name: &str) -> Result<i64, Error> {
        let value = self.store.lock_and_increment(counter_name).await?;
        tracing::debug!(counter = counter_name, allocated = value, "sequence allocated");
        Ok(value)
    }

    /// Read-only accessor for diagnostics and tests; never used on the posting
    /// path, where only [`Self::next`]'s locked increment is valid.
    pub async fn peek(&self, counter_name: &str) -> Result<i64, Error> {
        self.store.peek(counter_name).await
    }
}
