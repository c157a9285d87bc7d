//! Subledger reconciliation at post-time and close-time (SL-G1-G10, spec §4.9).

use crate::error::Error;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub reconciliation_id: Uuid,
    pub subledger_type: String,
    pub currency: String,
    pub subledger_balance: Decimal,
    pub control_balance: Decimal,
    pub matched: bool,
}

#[async_trait]
pub trait SubledgerStore: Send + Sync {
    async fn subledger_balance(&self, subledger_type: &str, currency: &str) -> Result<Decimal, Error>;
    async fn control_account_balance(&self, subledger_type: &str, currency: &str) -> Result<Decimal, Error>;
    /// Takes a row lock on the reconciliation-write row for
    /// `(subledger_type, currency)` before recording, preventing two concurrent
    /// reconciliation passes from double-matching the same balance (SL-G8).
    async fn lock_and_record(&self, record: &ReconciliationRecord) -> Result<(), Error>;
}

pub struct SubledgerReconciler<'a, S: SubledgerStore> {
    store: &'a S,
}

impl<'a, S: SubledgerStore> SubledgerReconciler<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Compares the aggregate subledger balance against the GL control-account
    /// balance read in the same transaction, for a single posting (SL-G4, SL-G5).
    /// A mismatch outside tolerance aborts the posting rather than letting it
    /// through with a recorded-but-ignored discrepancy.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn check_post_time(
        &self,
        subledger_type: &str,
        currency: &str,
        tolerance: Decimal,
    ) -> Result<ReconciliationRecord, Error> {
        let record = self.reconcile(subledger_type, currency, tolerance).await?;
        if !record.matched {
            return Err(Error::SubledgerReconciliationFailed {
                subledger_type: subledger_type.to_string(),
                currency: currency.to_string(),
                residual: (record.subledger_balance - record.control_balance).to_string(),
            });
        }
        Ok(record)
    }

    /// Same comparison, run as part of period close (SL-G5, SL-G6); a mismatch
    /// blocks the close rather than silently proceeding.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn check_close_time(
        &self,
        subledger_type: &str,
        currency: &str,
        tolerance: Decimal,
    ) -> Result<ReconciliationRecord, Error> {
        let record = self.reconcile(subledger_type, currency, tolerance).await?;
        if !record.matched {
            return Err(Error::SubledgerReconciliationFailed {
                subledger_type: subledger_type.to_string(),
                currency: currency.to_string(),
                residual: (record.subledger_balance - record.control_balance).to_string(),
            });
        }
        Ok(record)
    }

    async fn reconcile(
        &self,
        subledger_type: &str,
        currency: &str,
        tolerance: Decimal,
    ) -> Result<ReconciliationRecord, Error> {
        let subledger_balance = self.store.subledger_balance(subledger_type, currency).await?;
        let control_balance = self.store.control_account_balance(subledger_type, currency).await?;
        let matched = (subledger_balance - control_balance).abs() <= tolerance;

        let record = ReconciliationRecord {
            reconciliation_id: Uuid::new_v4(),
            subledger_type: subledger_type.to_string(),
            currency: currency.to_string(),
            subledger_balance,
            control_balance,
            matched,
        };

        self.store.lock_and_record(&record).await?;
        if !matched {
            tracing::warn!(
                subledger_type,
                currency,
                subledger_balance = %subledger_balance,
                control_balance = %control_balance,
                "subledger reconciliation mismatch"
            );
        }
        Ok(record)
    }
}

/// Declared close order across subledgers (spec §4.9), defaulted from config.
pub const DEFAULT_CLOSE_ORDER: &[&str] = &["inventory", "wip", "ar", "ap", "assets", "payroll", "gl"];
