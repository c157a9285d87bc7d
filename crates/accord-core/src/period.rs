//! Fiscal period lifecycle and effective-date gating (R12, R13, R25).

use crate::error::Error;
use crate::types::{FiscalPeriod, PeriodStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Kind of posting being gated against a period's status, so close-step postings
/// (e.g. closing entries) can still land while a period is `Closing` (R13).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostingKind {
    Ordinary,
    CloseStep,
    Adjustment,
}

#[async_trait]
pub trait PeriodStore: Send + Sync {
    async fn find_period(&self, effective_date: DateTime<Utc>) -> Result<Option<FiscalPeriod>, Error>;
    async fn lock_period(&self, period_id: uuid::Uuid) -> Result<FiscalPeriod, Error>;
    async fn set_status(&self, period_id: uuid::Uuid, status: PeriodStatus) -> Result<(), Error>;
}

#[async_trait]
impl<T: PeriodStore + ?Sized> PeriodStore for std::sync::Arc<T> {
    async fn find_period(&self, effective_date: DateTime<Utc>) -> Result<Option<FiscalPeriod>, Error> {
        (**self).find_period(effective_date).await
    }

    async fn lock_period(&self, period_id: uuid::Uuid) -> Result<FiscalPeriod, Error> {
        (**self).lock_period(period_id).await
    }

    async fn set_status(&self, period_id: uuid::Uuid, status: PeriodStatus) -> Result<(), Error> {
        (**self).set_status(period_id, status).await
    }
}

#[async_trait]
impl<'x, T: PeriodStore + ?Sized> PeriodStore for &'x T {
    async fn find_period(&self, effective_date: DateTime<Utc>) -> Result<Option<FiscalPeriod>, Error> {
        (**self).find_period(effective_date).await
    }

    async fn lock_period(&self, period_id: uuid::Uuid) -> Result<FiscalPeriod, Error> {
        (**self).lock_period(period_id).await
    }

    async fn set_status(&self, period_id: uuid::Uuid, status: PeriodStatus) -> Result<(), Error> {
        (**self).set_status(period_id, status).await
    }
}

pub struct PeriodService<S: PeriodStore> {
    store: S,
}

impl<S: PeriodStore> PeriodService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn find_period(&self, effective_date: DateTime<Utc>) -> Result<FiscalPeriod, Error> {
        self.store
            .find_period(effective_date)
            .await?
            .ok_or_else(|| Error::InvariantViolation(format!(
                "no fiscal period covers effective_date {effective_date}"
            )))
    }

    /// Gates a posting attempt against the period's current status (R12, R13, R25).
    ///
    /// `allows_adjustments` is checked independently of `status`: an adjustment
    /// posting is rejected whenever the period disallows adjustments, whether it
    /// is open, closing, or closed; when the period does allow adjustments, a
    /// closed period still accepts them.
    pub fn assert_open(&self, period: &FiscalPeriod, kind: PostingKind) -> Result<(), Error> {
        if kind == PostingKind::Adjustment && !period.allows_adjustments {
            return Err(Error::AdjustmentsNotAllowed(period.period_id.to_string()));
        }
        match (period.status, kind) {
            (PeriodStatus::Open, _) => Ok(()),
            (PeriodStatus::Closing, PostingKind::CloseStep) => Ok(()),
            (PeriodStatus::Closing, _) => Err(Error::PeriodClosing(period.period_id.to_string())),
            (PeriodStatus::Closed, PostingKind::Adjustment) => Ok(()),
            (PeriodStatus::Closed, _) => Err(Error::PeriodClosed(period.period_id.to_string())),
        }
    }

    /// Begins the close workflow for a period: takes the row lock, moves it to
    /// `Closing` so only close-step postings are accepted, and returns the locked
    /// row for the caller to drive reconciliation against.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn begin_close(&self, period_id: uuid::Uuid) -> Result<FiscalPeriod, Error> {
        let period = self.store.lock_period(period_id).await?;
        if period.status != PeriodStatus::Open {
            return Err(Error::InvariantViolation(format!(
                "period {period_id} is not open and cannot begin closing"
            )));
        }
        self.store.set_status(period_id, PeriodStatus::Closing).await?;
        tracing::info!(%period_id, "period transitioned to closing");
        Ok(FiscalPeriod {
            status: PeriodStatus::Closing,
            ..period
        })
    }

    /// Finalizes a close after subledger reconciliation (SL-G6) has passed.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn finalize_close(&self, period_id: uuid::Uuid) -> Result<(), Error> {
        self.store.set_status(period_id, PeriodStatus::Closed).await?;
        tracing::info!(%period_id, "period closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FiscalPeriod;
    use std::collections::HashMap;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct InMemoryPeriodStore {
        periods: Mutex<HashMap<Uuid, FiscalPeriod>>,
    }

    #[async_trait]
    impl PeriodStore for InMemoryPeriodStore {
        async fn find_period(&self, effective_date: DateTime<Utc>) -> Result<Option<FiscalPeriod>, Error> {
            let periods = self.periods.lock().await;
            Ok(periods
                .values()
                .find(|p| p.starts_at <= effective_date && effective_date < p.ends_at)
                .cloned())
        }

        async fn lock_period(&self, period_id: Uuid) -> Result<FiscalPeriod, Error> {
            let periods = self.periods.lock().await;
            periods
                .get(&period_id)
                .cloned()
                .ok_or_else(|| Error::InvariantViolation("no such period".into()))
        }

        async fn set_status(&self, period_id: Uuid, status: PeriodStatus) -> Result<(), Error> {
            let mut periods = self.periods.lock().await;
            if let Some(p) = periods.get_mut(&period_id) {
                p.status = status;
            }
            Ok(())
        }
    }

    fn sample_period(status: PeriodStatus) -> FiscalPeriod {
        sample_period_with_adjustments(status, true)
    }

    fn sample_period_with_adjustments(status: PeriodStatus, allows_adjustments: bool) -> FiscalPeriod {
        FiscalPeriod {
            period_id: Uuid::new_v4(),
            starts_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            ends_at: DateTime::parse_from_rfc3339("2026-02-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            status,
            allows_adjustments,
        }
    }

    #[tokio::test]
    async fn closing_period_rejects_ordinary_postings() {
        let store = InMemoryPeriodStore::default();
        let service = PeriodService::new(store);
        let period = sample_period(PeriodStatus::Closing);
        assert!(matches!(
            service.assert_open(&period, PostingKind::Ordinary),
            Err(Error::PeriodClosing(_))
        ));
        assert!(service.assert_open(&period, PostingKind::CloseStep).is_ok());
    }

    #[tokio::test]
    async fn closed_period_rejects_adjustments_when_not_permitted() {
        let store = InMemoryPeriodStore::default();
        let service = PeriodService::new(store);
        let period = sample_period_with_adjustments(PeriodStatus::Closed, false);
        assert!(matches!(
            service.assert_open(&period, PostingKind::Adjustment),
            Err(Error::AdjustmentsNotAllowed(_))
        ));
        assert!(matches!(
            service.assert_open(&period, PostingKind::Ordinary),
            Err(Error::PeriodClosed(_))
        ));
    }

    #[tokio::test]
    async fn closed_period_allows_adjustments_when_permitted() {
        let store = InMemoryPeriodStore::default();
        let service = PeriodService::new(store);
        let period = sample_period_with_adjustments(PeriodStatus::Closed, true);
        assert!(service.assert_open(&period, PostingKind::Adjustment).is_ok());
    }

    #[tokio::test]
    async fn open_period_rejects_adjustments_when_not_permitted() {
        let store = InMemoryPeriodStore::default();
        let service = PeriodService::new(store);
        let period = sample_period_with_adjustments(PeriodStatus::Open, false);
        assert!(matches!(
            service.assert_open(&period, PostingKind::Adjustment),
            Err(Error::AdjustmentsNotAllowed(_))
        ));
        assert!(service.assert_open(&period, PostingKind::Ordinary).is_ok());
    }

    #[tokio::test]
    async fn begin_close_then_finalize() {
        let store = InMemoryPeriodStore::default();
        let period = sample_period(PeriodStatus::Open);
        let period_id = period.period_id;
        store.periods.lock().await.insert(period_id, period);

        let service = PeriodService::new(store);
        let closing = service.begin_close(period_id).await.unwrap();
        assert_eq!(closing.status, PeriodStatus::Closing);
        service.finalize_close(period_id).await.unwrap();
    }
}
