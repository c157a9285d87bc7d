//! Journal writer: role resolution, balance check, sequence allocation, snapshot
//! staleness, idempotency, subledger reconciliation, and atomic multi-ledger
//! persistence (spec §4.7).

use crate::error::Error;
use crate::money::Side;
use crate::policy::registry::RoleBindingMap;
use crate::sequence::SequenceService;
use crate::snapshot::ReferenceSnapshot;
use crate::subledger::SubledgerReconciler;
use crate::types::{ActorId, EntryId, EventId, JournalEntry, JournalLine, PolicyId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A role-tagged, unresolved line produced by the meaning/intent-building stage,
/// prior to role resolution (L1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentLine {
    pub role: String,
    pub side: Side,
    pub money: crate::money::Money,
    pub is_rounding_line: bool,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// One ledger's share of an [`AccountingIntent`]: the ledger it targets and the
/// role-tagged lines to post there. A single event can fan out to several
/// ledgers (e.g. GL and INVENTORY) that must all post atomically or not at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerIntent {
    pub ledger_id: String,
    pub lines: Vec<IntentLine>,
}

/// A subledger-vs-control-account check that must pass before this intent's
/// entries are persisted (SL-G1-G5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubledgerCheck {
    pub subledger_type: String,
    pub currency: String,
    pub tolerance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountingIntent {
    pub event_id: EventId,
    pub policy_id: PolicyId,
    pub effective_date: DateTime<Utc>,
    pub ledger_intents: Vec<LedgerIntent>,
    #[serde(default)]
    pub subledger_checks: Vec<SubledgerCheck>,
}

#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Row-locks on the idempotency source (`event_id`) before persisting;
    /// returns the previously posted entries if this event was already posted.
    async fn lock_for_post(&self, event_id: EventId) -> Result<Option<Vec<EntryId>>, Error>;

    /// Persists every entry in `entries` atomically: either all of them commit
    /// or none do (spec §4.7's multi-ledger atomicity requirement).
    async fn persist_entries(&self, entries: &[JournalEntry]) -> Result<(), Error>;

    /// Looks up one previously persisted entry by id, for the reference replay
    /// harness to re-derive a canonical hash over what was actually written.
    async fn find_entry(&self, entry_id: EntryId) -> Result<Option<JournalEntry>, Error>;
}

pub struct JournalWriter<'a, J: JournalStore, Seq: crate::sequence::SequenceStore, Sub: crate::subledger::SubledgerStore> {
    store: &'a J,
    sequences: &'a SequenceService<Seq>,
    subledgers: &'a SubledgerReconciler<'a, Sub>,
}

impl<'a, J: JournalStore, Seq: crate::sequence::SequenceStore, Sub: crate::subledger::SubledgerStore>
    JournalWriter<'a, J, Seq, Sub>
{
    pub fn new(store: &'a J, sequences: &'a SequenceService<Seq>, subledgers: &'a SubledgerReconciler<'a, Sub>) -> Self {
        Self { store, sequences, subledgers }
    }

    #[tracing::instrument(level = "info", skip(self, intent, role_bindings, current_snapshot), fields(event_id = %intent.event_id))]
    pub async fn post(
        &self,
        intent: &AccountingIntent,
        role_bindings: &RoleBindingMap,
        intent_snapshot: &ReferenceSnapshot,
        current_snapshot: &ReferenceSnapshot,
        actor: &ActorId,
        posted_at: DateTime<Utc>,
    ) -> Result<Vec<JournalEntry>, Error> {
        if intent_snapshot != current_snapshot {
            return Err(Error::StaleSnapshot {
                expected: current_snapshot.fingerprint(),
                found: intent_snapshot.fingerprint(),
            });
        }

        if let Some(_existing_entries) = self.store.lock_for_post(intent.event_id).await? {
            tracing::warn!(event_id = %intent.event_id, "event already posted, short-circuiting");
            let _ = actor;
            return Err(Error::AlreadyPosted);
        }

        for check in &intent.subledger_checks {
            self.subledgers
                .check_post_time(&check.subledger_type, &check.currency, check.tolerance)
                .await?;
        }

        let mut entries = Vec::with_capacity(intent.ledger_intents.len());
        for ledger_intent in &intent.ledger_intents {
            let lines = self.resolve_roles(intent, ledger_intent, role_bindings)?;
            Self::assert_balanced(&lines)?;

            let sequence = self.sequences.next(&ledger_intent.ledger_id).await?;

            entries.push(JournalEntry {
                entry_id: Uuid::new_v4(),
                ledger_id: ledger_intent.ledger_id.clone(),
                sequence,
                event_id: intent.event_id,
                policy_id: intent.policy_id.clone(),
                effective_date: intent.effective_date,
                posted_at,
                lines,
            });
        }

        self.store.persist_entries(&entries).await?;
        tracing::info!(
            event_id = %intent.event_id,
            entries = entries.len(),
            "journal entries posted"
        );
        Ok(entries)
    }

    fn resolve_roles(
        &self,
        intent: &AccountingIntent,
        ledger_intent: &LedgerIntent,
        role_bindings: &RoleBindingMap,
    ) -> Result<Vec<JournalLine>, Error> {
        let _ = intent;
        ledger_intent
            .lines
            .iter()
            .map(|line| {
                let (account_id, bound_ledger_id) = role_bindings
                    .get(&line.role)
                    .cloned()
                    .ok_or_else(|| Error::MissingRoleBinding(line.role.clone()))?;
                if bound_ledger_id != ledger_intent.ledger_id {
                    return Err(Error::MissingRoleBinding(format!(
                        "role '{}' is bound to ledger '{}', not '{}'",
                        line.role, bound_ledger_id, ledger_intent.ledger_id
                    )));
                }
                Ok(JournalLine {
                    line_id: Uuid::new_v4(),
                    account_id,
                    role: line.role.clone(),
                    side: line.side,
                    money: line.money.clone(),
                    is_rounding_line: line.is_rounding_line,
                    metadata: line.metadata.clone(),
                })
            })
            .collect()
    }

    /// Checks per-currency debit/credit balance (R4) and that at most one line per
    /// currency is flagged as a rounding line (R5, R22).
    fn assert_balanced(lines: &[JournalLine]) -> Result<(), Error> {
        let mut residual_by_currency: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut rounding_count_by_currency: BTreeMap<String, u32> = BTreeMap::new();

        for line in lines {
            let currency = line.money.currency().code().to_string();
            let signed = match line.side {
                Side::Debit => line.money.amount(),
                Side::Credit => -line.money.amount(),
            };
            *residual_by_currency.entry(currency.clone()).or_insert(Decimal::ZERO) += signed;
            if line.is_rounding_line {
                *rounding_count_by_currency.entry(currency).or_insert(0) += 1;
            }
        }

        for (currency, count) in &rounding_count_by_currency {
            if *count > 1 {
                return Err(Error::InvariantViolation(format!(
                    "entry has {count} rounding lines for currency {currency}, at most one is allowed"
                )));
            }
        }

        for (currency, residual) in residual_by_currency {
            if !residual.is_zero() {
                return Err(Error::Unbalanced {
                    currency,
                    residual: residual.to_string(),
                });
            }
        }

        Ok(())
    }
}
