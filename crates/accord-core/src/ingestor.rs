//! Event ingestion: payload-hash verification and idempotency-key uniqueness
//! (R1, R2, R3, R8).

use crate::audit::hash_payload;
use crate::error::Error;
use crate::types::{Event, EventId, InterpretationOutcome};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// First time this event has been seen; the pipeline should proceed.
    Fresh(Event),
    /// An event with this `event_id` (or idempotency key) was already ingested
    /// with an identical payload; returns its previously recorded outcome rather
    /// than re-running the pipeline (R3).
    Duplicate(InterpretationOutcome),
}

#[async_trait]
pub trait IngestStore: Send + Sync {
    /// Looks up a previously ingested event by id, returning its payload hash and
    /// recorded outcome if present.
    async fn find_by_event_id(
        &self,
        event_id: EventId,
    ) -> Result<Option<(String, InterpretationOutcome)>, Error>;

    /// Takes a row lock on the idempotency key before insertion, returning the
    /// existing outcome if the key is already claimed by a different event_id.
    async fn lock_idempotency_key(
        &self,
        idempotency_key: &str,
        event_id: EventId,
    ) -> Result<Option<InterpretationOutcome>, Error>;

    async fn record_ingested(&self, event: &Event, payload_hash: &str) -> Result<(), Error>;
}

#[async_trait]
impl<T: IngestStore + ?Sized> IngestStore for std::sync::Arc<T> {
    async fn find_by_event_id(
        &self,
        event_id: EventId,
    ) -> Result<Option<(String, InterpretationOutcome)>, Error> {
        (**self).find_by_event_id(event_id).await
    }

    async fn lock_idempotency_key(
        &self,
        idempotency_key: &str,
        event_id: EventId,
    ) -> Result<Option<InterpretationOutcome>, Error> {
        (**self).lock_idempotency_key(idempotency_key, event_id).await
    }

    async fn record_ingested(&self, event: &Event, payload_hash: &str) -> Result<(), Error> {
        (**self).record_ingested(event, payload_hash).await
    }
}

#[async_trait]
impl<'x, T: IngestStore + ?Sized> IngestStore for &'x T {
    async fn find_by_event_id(
        &self,
        event_id: EventId,
    ) -> Result<Option<(String, InterpretationOutcome)>, Error> {
        (**self).find_by_event_id(event_id).await
    }

    async fn lock_idempotency_key(
        &self,
        idempotency_key: &str,
        event_id: EventId,
    ) -> Result<Option<InterpretationOutcome>, Error> {
        (**self).lock_idempotency_key(idempotency_key, event_id).await
    }

    async fn record_ingested(&self, event: &Event, payload_hash: &str) -> Result<(), Error> {
        (**self).record_ingested(event, payload_hash).await
    }
}

pub struct Ingestor<S: IngestStore> {
    store: S,
}

impl<S: IngestStore> Ingestor<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[tracing::instrument(level = "debug", skip(self, event), fields(event_id = %event.event_id))]
    pub async fn ingest(&self, event: Event) -> Result<IngestOutcome, Error> {
        let payload_hash = hash_payload(&event.payload);

        if let Some((existing_hash, outcome)) = self.store.find_by_event_id(event.event_id).await? {
            if existing_hash != payload_hash {
                return Err(Error::ProtocolViolation(format!(
                    "event_id {} was previously ingested with a different payload",
                    event.event_id
                )));
            }
            tracing::debug!(event_id = %event.event_id, "duplicate event_id, returning recorded outcome");
            return Ok(IngestOutcome::Duplicate(outcome));
        }

        if let Some(outcome) = self
            .store
            .lock_idempotency_key(&event.idempotency_key, event.event_id)
            .await?
        {
            tracing::debug!(
                event_id = %event.event_id,
                idempotency_key = %event.idempotency_key,
                "idempotency key already claimed, returning recorded outcome"
            );
            return Ok(IngestOutcome::Duplicate(outcome));
        }

        self.store.record_ingested(&event, &payload_hash).await?;
        Ok(IngestOutcome::Fresh(event))
    }
}
