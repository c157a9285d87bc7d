//! Durable persistence: a Postgres backend for production and an in-memory
//! backend for tests, selected by [`LedgerStorageConfig`] exactly the way the
//! teacher's `LedgerStorageConfig`/`PersistentLedger` split works.

use crate::approval::ApprovalStore;
use crate::audit::{AuditEvent, GENESIS_HASH};
use crate::error::Error;
use crate::ingestor::IngestStore;
use crate::journal::JournalStore;
use crate::link::LinkStore;
use crate::period::PeriodStore;
use crate::sequence::SequenceStore;
use crate::subledger::{ReconciliationRecord, SubledgerStore};
use crate::types::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, EconomicLink, EntryId, Event, EventId, FiscalPeriod,
    InterpretationOutcome, JournalEntry, PeriodStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Selects which storage backend [`PersistentLedger::connect`] should establish.
#[derive(Debug, Clone)]
pub enum LedgerStorageConfig {
    Memory,
    Postgres { database_url: String, max_connections: u32 },
}

enum Backend {
    Memory(MemoryState),
    Postgres(PgPool),
}

#[derive(Default)]
struct MemoryState {
    sequences: Mutex<HashMap<String, i64>>,
    periods: Mutex<HashMap<Uuid, FiscalPeriod>>,
    ingested_by_event: Mutex<HashMap<EventId, (String, InterpretationOutcome)>>,
    ingested_by_key: Mutex<HashMap<String, EventId>>,
    audit_events: Mutex<Vec<AuditEvent>>,
    journal_entries: Mutex<HashMap<EventId, Vec<JournalEntry>>>,
    links: Mutex<Vec<EconomicLink>>,
    artifact_metadata: Mutex<HashMap<(String, String), Value>>,
    subledger_balances: Mutex<HashMap<(String, String), Decimal>>,
    control_balances: Mutex<HashMap<(String, String), Decimal>>,
    reconciliations: Mutex<Vec<ReconciliationRecord>>,
    approval_requests: Mutex<HashMap<Uuid, ApprovalRequest>>,
    pending_approval_by_entity: Mutex<HashMap<String, Uuid>>,
    approval_decisions: Mutex<HashMap<(Uuid, String), ApprovalDecision>>,
    outcomes: Mutex<HashMap<EventId, InterpretationOutcome>>,
}

/// A single handle implementing every storage trait the pipeline needs, backed
/// by either Postgres or an in-process map depending on how it was constructed.
pub struct PersistentLedger {
    backend: Backend,
}

impl PersistentLedger {
    pub async fn connect(config: LedgerStorageConfig) -> Result<Self, Error> {
        let backend = match config {
            LedgerStorageConfig::Memory => Backend::Memory(MemoryState::default()),
            LedgerStorageConfig::Postgres { database_url, max_connections } => {
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(&database_url)
                    .await
                    .map_err(|e| Error::Storage(format!("failed to connect to postgres: {e}")))?;
                Backend::Postgres(pool)
            }
        };
        Ok(Self { backend })
    }

    /// Appends an audit event within whatever transaction the caller is
    /// conceptually inside; used alongside every state-changing store method.
    pub async fn append_audit_event(&self, event: AuditEvent) -> Result<(), Error> {
        match &self.backend {
            Backend::Memory(state) => {
                state.audit_events.lock().await.push(event);
                Ok(())
            }
            Backend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO audit_events (audit_seq, event_id, stage, payload, recorded_at, payload_hash, prev_hash, event_hash) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(event.audit_seq)
                .bind(event.event_id)
                .bind(&event.stage)
                .bind(&event.payload)
                .bind(event.recorded_at)
                .bind(&event.payload_hash)
                .bind(&event.prev_hash)
                .bind(&event.event_hash)
                .execute(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            }
        }
    }

    pub async fn latest_audit_hash(&self) -> Result<String, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(state
                .audit_events
                .lock()
                .await
                .last()
                .map(|e| e.event_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string())),
            Backend::Postgres(pool) => {
                let row: Option<(String,)> =
                    sqlx::query_as("SELECT event_hash FROM audit_events ORDER BY audit_seq DESC LIMIT 1")
                        .fetch_optional(pool)
                        .await
                        .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(row.map(|(h,)| h).unwrap_or_else(|| GENESIS_HASH.to_string()))
            }
        }
    }
}

#[async_trait]
impl SequenceStore for PersistentLedger {
    async fn lock_and_increment(&self, counter_name: &str) -> Result<i64, Error> {
        match &self.backend {
            Backend::Memory(state) => {
                let mut sequences = state.sequences.lock().await;
                let entry = sequences.entry(counter_name.to_string()).or_insert(0);
                *entry += 1;
                Ok(*entry)
            }
            Backend::Postgres(pool) => {
                let mut tx = pool.begin().await.map_err(|e| Error::Storage(e.to_string()))?;
                let row: (i64,) = sqlx::query_as(
                    "INSERT INTO sequence_counters (counter_name, value) VALUES ($1, 1) \
                     ON CONFLICT (counter_name) DO UPDATE SET value = sequence_counters.value + 1 \
                     RETURNING value",
                )
                .bind(counter_name)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                tx.commit().await.map_err(|e| Error::Storage(e.to_string()))?;
                Ok(row.0)
            }
        }
    }

    async fn peek(&self, counter_name: &str) -> Result<i64, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(*state.sequences.lock().await.get(counter_name).unwrap_or(&0)),
            Backend::Postgres(pool) => {
                let row: Option<(i64,)> =
                    sqlx::query_as("SELECT value FROM sequence_counters WHERE counter_name = $1")
                        .bind(counter_name)
                        .fetch_optional(pool)
                        .await
                        .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(row.map(|(v,)| v).unwrap_or(0))
            }
        }
    }
}

#[async_trait]
impl PeriodStore for PersistentLedger {
    async fn find_period(&self, effective_date: DateTime<Utc>) -> Result<Option<FiscalPeriod>, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(state
                .periods
                .lock()
                .await
                .values()
                .find(|p| p.starts_at <= effective_date && effective_date < p.ends_at)
                .cloned()),
            Backend::Postgres(pool) => {
                sqlx::query_as::<_, PeriodRow>(
                    "SELECT period_id, starts_at, ends_at, status, allows_adjustments FROM fiscal_periods \
                     WHERE starts_at <= $1 AND $1 < ends_at",
                )
                .bind(effective_date)
                .fetch_optional(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?
                .map(TryInto::try_into)
                .transpose()
            }
        }
    }

    async fn lock_period(&self, period_id: Uuid) -> Result<FiscalPeriod, Error> {
        match &self.backend {
            Backend::Memory(state) => state
                .periods
                .lock()
                .await
                .get(&period_id)
                .cloned()
                .ok_or_else(|| Error::InvariantViolation(format!("no such period {period_id}"))),
            Backend::Postgres(pool) => {
                let row: PeriodRow = sqlx::query_as(
                    "SELECT period_id, starts_at, ends_at, status, allows_adjustments FROM fiscal_periods WHERE period_id = $1 FOR UPDATE",
                )
                .bind(period_id)
                .fetch_one(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                row.try_into()
            }
        }
    }

    async fn set_status(&self, period_id: Uuid, status: PeriodStatus) -> Result<(), Error> {
        match &self.backend {
            Backend::Memory(state) => {
                if let Some(p) = state.periods.lock().await.get_mut(&period_id) {
                    p.status = status;
                }
                Ok(())
            }
            Backend::Postgres(pool) => {
                sqlx::query("UPDATE fiscal_periods SET status = $1 WHERE period_id = $2")
                    .bind(period_status_str(status))
                    .bind(period_id)
                    .execute(pool)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            }
        }
    }
}

#[derive(sqlx::FromRow)]
struct PeriodRow {
    period_id: Uuid,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    status: String,
    allows_adjustments: bool,
}

impl TryFrom<PeriodRow> for FiscalPeriod {
    type Error = Error;

    fn try_from(row: PeriodRow) -> Result<Self, Error> {
        Ok(FiscalPeriod {
            period_id: row.period_id,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            status: period_status_from_str(&row.status)?,
            allows_adjustments: row.allows_adjustments,
        })
    }
}

fn period_status_str(status: PeriodStatus) -> &'static str {
    match status {
        PeriodStatus::Open => "open",
        PeriodStatus::Closing => "closing",
        PeriodStatus::Closed => "closed",
    }
}

fn period_status_from_str(raw: &str) -> Result<PeriodStatus, Error> {
    match raw {
        "open" => Ok(PeriodStatus::Open),
        "closing" => Ok(PeriodStatus::Closing),
        "closed" => Ok(PeriodStatus::Closed),
        other => Err(Error::Storage(format!("unknown period status '{other}'"))),
    }
}

#[async_trait]
impl IngestStore for PersistentLedger {
    async fn find_by_event_id(
        &self,
        event_id: EventId,
    ) -> Result<Option<(String, InterpretationOutcome)>, Error> {
        match &self.backend {
            Backend::Memory(state) => {
                let placeholder = state.ingested_by_event.lock().await.get(&event_id).cloned();
                let Some((hash, placeholder_outcome)) = placeholder else {
                    return Ok(None);
                };
                // `record_ingested` writes a PENDING placeholder before interpretation
                // runs; once `OutcomeRecorder` records the real outcome it lands in
                // `outcomes` rather than mutating this entry, so a duplicate lookup
                // must prefer `outcomes` whenever it has since been filled in.
                let recorded = state.outcomes.lock().await.get(&event_id).cloned();
                Ok(Some((hash, recorded.unwrap_or(placeholder_outcome))))
            }
            Backend::Postgres(pool) => {
                let row: Option<(String, Value)> =
                    sqlx::query_as("SELECT payload_hash, outcome FROM ingested_events WHERE event_id = $1")
                        .bind(event_id)
                        .fetch_optional(pool)
                        .await
                        .map_err(|e| Error::Storage(e.to_string()))?;
                row.map(|(hash, outcome)| {
                    let outcome: InterpretationOutcome =
                        serde_json::from_value(outcome).map_err(|e| Error::Serialization(e.to_string()))?;
                    Ok((hash, outcome))
                })
                .transpose()
            }
        }
    }

    async fn lock_idempotency_key(
        &self,
        idempotency_key: &str,
        event_id: EventId,
    ) -> Result<Option<InterpretationOutcome>, Error> {
        match &self.backend {
            Backend::Memory(state) => {
                let existing_event_id = {
                    let keys = state.ingested_by_key.lock().await;
                    keys.get(idempotency_key).copied()
                };
                match existing_event_id {
                    Some(existing_event_id) if existing_event_id != event_id => {
                        Ok(self.find_by_event_id(existing_event_id).await?.map(|(_, outcome)| outcome))
                    }
                    _ => Ok(None),
                }
            }
            Backend::Postgres(pool) => {
                let row: Option<(Uuid,)> = sqlx::query_as(
                    "SELECT event_id FROM idempotency_keys WHERE idempotency_key = $1 FOR UPDATE",
                )
                .bind(idempotency_key)
                .fetch_optional(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                match row {
                    Some((existing_event_id,)) if existing_event_id != event_id => {
                        self.find_by_event_id(existing_event_id).await.map(|r| r.map(|(_, o)| o))
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    async fn record_ingested(&self, event: &Event, payload_hash: &str) -> Result<(), Error> {
        match &self.backend {
            Backend::Memory(state) => {
                state.ingested_by_event.lock().await.insert(
                    event.event_id,
                    (
                        payload_hash.to_string(),
                        InterpretationOutcome::Failed {
                            code: "PENDING".into(),
                            message: "interpretation in progress".into(),
                            retry_count: 0,
                        },
                    ),
                );
                state
                    .ingested_by_key
                    .lock()
                    .await
                    .insert(event.idempotency_key.clone(), event.event_id);
                Ok(())
            }
            Backend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO ingested_events (event_id, payload_hash, outcome) VALUES ($1, $2, $3)",
                )
                .bind(event.event_id)
                .bind(payload_hash)
                .bind(serde_json::json!({"status": "failed", "code": "PENDING", "message": "interpretation in progress", "retry_count": 0}))
                .execute(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                sqlx::query("INSERT INTO idempotency_keys (idempotency_key, event_id) VALUES ($1, $2)")
                    .bind(&event.idempotency_key)
                    .bind(event.event_id)
                    .execute(pool)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl JournalStore for PersistentLedger {
    async fn lock_for_post(&self, event_id: EventId) -> Result<Option<Vec<EntryId>>, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(state
                .journal_entries
                .lock()
                .await
                .get(&event_id)
                .map(|entries| entries.iter().map(|e| e.entry_id).collect())),
            Backend::Postgres(pool) => {
                let rows: Vec<(Uuid,)> =
                    sqlx::query_as("SELECT entry_id FROM journal_entries WHERE event_id = $1 FOR UPDATE")
                        .bind(event_id)
                        .fetch_all(pool)
                        .await
                        .map_err(|e| Error::Storage(e.to_string()))?;
                if rows.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(rows.into_iter().map(|(id,)| id).collect()))
                }
            }
        }
    }

    /// Persists every entry in one atomic unit: the in-memory backend inserts
    /// under a single lock acquisition, the Postgres backend wraps all entries
    /// and lines in one transaction, so a mid-batch failure leaves no partial
    /// ledger write behind (spec §4.7's multi-ledger atomicity requirement).
    async fn persist_entries(&self, entries: &[JournalEntry]) -> Result<(), Error> {
        match &self.backend {
            Backend::Memory(state) => {
                if let Some(first) = entries.first() {
                    state
                        .journal_entries
                        .lock()
                        .await
                        .insert(first.event_id, entries.to_vec());
                }
                Ok(())
            }
            Backend::Postgres(pool) => {
                let mut tx = pool.begin().await.map_err(|e| Error::Storage(e.to_string()))?;

                for entry in entries {
                    sqlx::query(
                        "INSERT INTO journal_entries (entry_id, ledger_id, sequence, event_id, policy_id, effective_date, posted_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    )
                    .bind(entry.entry_id)
                    .bind(&entry.ledger_id)
                    .bind(entry.sequence)
                    .bind(entry.event_id)
                    .bind(&entry.policy_id)
                    .bind(entry.effective_date)
                    .bind(entry.posted_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;

                    for line in &entry.lines {
                        sqlx::query(
                            "INSERT INTO journal_lines (line_id, entry_id, account_id, role, side, amount, currency, is_rounding_line, metadata) \
                             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                        )
                        .bind(line.line_id)
                        .bind(entry.entry_id)
                        .bind(line.account_id)
                        .bind(&line.role)
                        .bind(format!("{:?}", line.side))
                        .bind(line.money.amount().to_string())
                        .bind(line.money.currency().code())
                        .bind(line.is_rounding_line)
                        .bind(serde_json::to_value(&line.metadata).map_err(|e| Error::Serialization(e.to_string()))?)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| Error::Storage(e.to_string()))?;
                    }
                }

                tx.commit().await.map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn find_entry(&self, entry_id: EntryId) -> Result<Option<JournalEntry>, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(state
                .journal_entries
                .lock()
                .await
                .values()
                .flatten()
                .find(|e| e.entry_id == entry_id)
                .cloned()),
            Backend::Postgres(pool) => {
                let entry_row: Option<JournalEntryRow> = sqlx::query_as(
                    "SELECT entry_id, ledger_id, sequence, event_id, policy_id, effective_date, posted_at \
                     FROM journal_entries WHERE entry_id = $1",
                )
                .bind(entry_id)
                .fetch_optional(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                let Some(entry_row) = entry_row else { return Ok(None) };

                let line_rows: Vec<JournalLineRow> = sqlx::query_as(
                    "SELECT line_id, account_id, role, side, amount, currency, is_rounding_line, metadata \
                     FROM journal_lines WHERE entry_id = $1",
                )
                .bind(entry_id)
                .fetch_all(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;

                let lines = line_rows.into_iter().map(TryInto::try_into).collect::<Result<Vec<_>, Error>>()?;
                Ok(Some(entry_row.into_entry(lines)))
            }
        }
    }
}

#[derive(sqlx::FromRow)]
struct JournalEntryRow {
    entry_id: Uuid,
    ledger_id: String,
    sequence: i64,
    event_id: Uuid,
    policy_id: String,
    effective_date: DateTime<Utc>,
    posted_at: DateTime<Utc>,
}

impl JournalEntryRow {
    fn into_entry(self, lines: Vec<crate::types::JournalLine>) -> JournalEntry {
        JournalEntry {
            entry_id: self.entry_id,
            ledger_id: self.ledger_id,
            sequence: self.sequence,
            event_id: self.event_id,
            policy_id: self.policy_id,
            effective_date: self.effective_date,
            posted_at: self.posted_at,
            lines,
        }
    }
}

#[derive(sqlx::FromRow)]
struct JournalLineRow {
    line_id: Uuid,
    account_id: Uuid,
    role: String,
    side: String,
    amount: String,
    currency: String,
    is_rounding_line: bool,
    metadata: Value,
}

impl TryFrom<JournalLineRow> for crate::types::JournalLine {
    type Error = Error;

    fn try_from(row: JournalLineRow) -> Result<Self, Error> {
        use std::str::FromStr;
        let side = match row.side.as_str() {
            "Debit" => crate::money::Side::Debit,
            "Credit" => crate::money::Side::Credit,
            other => return Err(Error::Storage(format!("unknown side '{other}'"))),
        };
        let amount =
            Decimal::from_str(&row.amount).map_err(|e| Error::Storage(format!("invalid stored amount: {e}")))?;
        let currency = crate::money::Currency::new(&row.currency)?;
        Ok(crate::types::JournalLine {
            line_id: row.line_id,
            account_id: row.account_id,
            role: row.role,
            side,
            money: crate::money::Money::new(amount, currency)?,
            is_rounding_line: row.is_rounding_line,
            metadata: serde_json::from_value(row.metadata).map_err(|e| Error::Serialization(e.to_string()))?,
        })
    }
}

#[async_trait]
impl LinkStore for PersistentLedger {
    async fn links_from_parent(&self, parent_ref: &str) -> Result<Vec<EconomicLink>, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(state
                .links
                .lock()
                .await
                .iter()
                .filter(|l| l.parent_ref == parent_ref)
                .cloned()
                .collect()),
            Backend::Postgres(pool) => {
                let rows: Vec<LinkRow> = sqlx::query_as(
                    "SELECT link_id, parent_ref, parent_type, child_ref, child_type, link_type, creating_event_id, created_at \
                     FROM economic_links WHERE parent_ref = $1",
                )
                .bind(parent_ref)
                .fetch_all(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                rows.into_iter().map(TryInto::try_into).collect()
            }
        }
    }

    async fn links_to_child(&self, child_ref: &str) -> Result<Vec<EconomicLink>, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(state
                .links
                .lock()
                .await
                .iter()
                .filter(|l| l.child_ref == child_ref)
                .cloned()
                .collect()),
            Backend::Postgres(pool) => {
                let rows: Vec<LinkRow> = sqlx::query_as(
                    "SELECT link_id, parent_ref, parent_type, child_ref, child_type, link_type, creating_event_id, created_at \
                     FROM economic_links WHERE child_ref = $1",
                )
                .bind(child_ref)
                .fetch_all(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                rows.into_iter().map(TryInto::try_into).collect()
            }
        }
    }

    async fn persist_link(&self, link: &EconomicLink) -> Result<(), Error> {
        match &self.backend {
            Backend::Memory(state) => {
                state.links.lock().await.push(link.clone());
                Ok(())
            }
            Backend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO economic_links (link_id, parent_ref, parent_type, child_ref, child_type, link_type, creating_event_id, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(link.link_id)
                .bind(&link.parent_ref)
                .bind(&link.parent_type)
                .bind(&link.child_ref)
                .bind(&link.child_type)
                .bind(format!("{:?}", link.link_type))
                .bind(link.creating_event_id)
                .bind(link.created_at)
                .execute(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn artifact_metadata(&self, artifact_ref: &str, key: &str) -> Result<Option<Value>, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(state
                .artifact_metadata
                .lock()
                .await
                .get(&(artifact_ref.to_string(), key.to_string()))
                .cloned()),
            Backend::Postgres(pool) => {
                let row: Option<(Value,)> = sqlx::query_as(
                    "SELECT value FROM artifact_metadata WHERE artifact_ref = $1 AND key = $2",
                )
                .bind(artifact_ref)
                .bind(key)
                .fetch_optional(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(row.map(|(v,)| v))
            }
        }
    }
}

#[derive(sqlx::FromRow)]
struct LinkRow {
    link_id: Uuid,
    parent_ref: String,
    parent_type: String,
    child_ref: String,
    child_type: String,
    link_type: String,
    creating_event_id: Uuid,
    created_at: DateTime<Utc>,
}

impl TryFrom<LinkRow> for EconomicLink {
    type Error = Error;

    fn try_from(row: LinkRow) -> Result<Self, Error> {
        let link_type = match row.link_type.as_str() {
            "FulfilledBy" => crate::types::LinkType::FulfilledBy,
            "PaidBy" => crate::types::LinkType::PaidBy,
            "AppliedTo" => crate::types::LinkType::AppliedTo,
            "ReversedBy" => crate::types::LinkType::ReversedBy,
            "CorrectedBy" => crate::types::LinkType::CorrectedBy,
            "ConsumedBy" => crate::types::LinkType::ConsumedBy,
            "DerivedFrom" => crate::types::LinkType::DerivedFrom,
            "AllocatedTo" => crate::types::LinkType::AllocatedTo,
            "AllocatedFrom" => crate::types::LinkType::AllocatedFrom,
            "MatchedWith" => crate::types::LinkType::MatchedWith,
            "References" => crate::types::LinkType::References,
            other => return Err(Error::Storage(format!("unknown link_type '{other}'"))),
        };
        Ok(EconomicLink {
            link_id: row.link_id,
            parent_ref: row.parent_ref,
            parent_type: row.parent_type,
            child_ref: row.child_ref,
            child_type: row.child_type,
            link_type,
            creating_event_id: row.creating_event_id,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl SubledgerStore for PersistentLedger {
    async fn subledger_balance(&self, subledger_type: &str, currency: &str) -> Result<Decimal, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(*state
                .subledger_balances
                .lock()
                .await
                .get(&(subledger_type.to_string(), currency.to_string()))
                .unwrap_or(&Decimal::ZERO)),
            Backend::Postgres(pool) => {
                let row: (Option<String>,) = sqlx::query_as(
                    "SELECT SUM(CASE WHEN side = 'Debit' THEN amount::numeric ELSE -amount::numeric END)::text \
                     FROM subledger_entries se JOIN journal_entries je USING (entry_id) \
                     WHERE se.subledger_type = $1 AND se.currency = $2",
                )
                .bind(subledger_type)
                .bind(currency)
                .fetch_one(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                parse_decimal_opt(row.0)
            }
        }
    }

    async fn control_account_balance(&self, subledger_type: &str, currency: &str) -> Result<Decimal, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(*state
                .control_balances
                .lock()
                .await
                .get(&(subledger_type.to_string(), currency.to_string()))
                .unwrap_or(&Decimal::ZERO)),
            Backend::Postgres(pool) => {
                let row: (Option<String>,) = sqlx::query_as(
                    "SELECT SUM(CASE WHEN jl.side = 'Debit' THEN jl.amount::numeric ELSE -jl.amount::numeric END)::text \
                     FROM journal_lines jl JOIN accounts a USING (account_id) \
                     WHERE a.is_control_account AND a.subledger_type = $1 AND jl.currency = $2",
                )
                .bind(subledger_type)
                .bind(currency)
                .fetch_one(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                parse_decimal_opt(row.0)
            }
        }
    }

    async fn lock_and_record(&self, record: &ReconciliationRecord) -> Result<(), Error> {
        match &self.backend {
            Backend::Memory(state) => {
                state.reconciliations.lock().await.push(record.clone());
                Ok(())
            }
            Backend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO reconciliation_records (reconciliation_id, subledger_type, currency, subledger_balance, control_balance, matched) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(record.reconciliation_id)
                .bind(&record.subledger_type)
                .bind(&record.currency)
                .bind(record.subledger_balance.to_string())
                .bind(record.control_balance.to_string())
                .bind(record.matched)
                .execute(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            }
        }
    }
}

fn parse_decimal_opt(raw: Option<String>) -> Result<Decimal, Error> {
    use std::str::FromStr;
    match raw {
        None => Ok(Decimal::ZERO),
        Some(s) => Decimal::from_str(&s).map_err(|e| Error::Storage(e.to_string())),
    }
}

#[async_trait]
impl ApprovalStore for PersistentLedger {
    async fn persist_request(&self, request: &ApprovalRequest) -> Result<(), Error> {
        match &self.backend {
            Backend::Memory(state) => {
                state.approval_requests.lock().await.insert(request.request_id, request.clone());
                state
                    .pending_approval_by_entity
                    .lock()
                    .await
                    .insert(request.entity_ref.clone(), request.request_id);
                Ok(())
            }
            Backend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO approval_requests (request_id, event_id, entity_ref, policy_id, policy_hash, request_hash, currency, status, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                )
                .bind(request.request_id)
                .bind(request.event_id)
                .bind(&request.entity_ref)
                .bind(&request.policy_id)
                .bind(&request.policy_hash)
                .bind(request.request_hash.clone())
                .bind(&request.currency)
                .bind(approval_status_str(request.status))
                .bind(request.created_at)
                .execute(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn find_request(&self, request_id: Uuid) -> Result<Option<ApprovalRequest>, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(state.approval_requests.lock().await.get(&request_id).cloned()),
            Backend::Postgres(pool) => {
                sqlx::query_as::<_, ApprovalRequestRow>(
                    "SELECT request_id, event_id, entity_ref, policy_id, policy_hash, request_hash, currency, status, created_at \
                     FROM approval_requests WHERE request_id = $1",
                )
                .bind(request_id)
                .fetch_optional(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?
                .map(TryInto::try_into)
                .transpose()
            }
        }
    }

    async fn lock_pending_for_entity(&self, entity_ref: &str) -> Result<Option<ApprovalRequest>, Error> {
        match &self.backend {
            Backend::Memory(state) => {
                let pending = state.pending_approval_by_entity.lock().await;
                if let Some(request_id) = pending.get(entity_ref) {
                    let requests = state.approval_requests.lock().await;
                    if let Some(r) = requests.get(request_id) {
                        if r.status == ApprovalStatus::Pending {
                            return Ok(Some(r.clone()));
                        }
                    }
                }
                Ok(None)
            }
            Backend::Postgres(pool) => {
                sqlx::query_as::<_, ApprovalRequestRow>(
                    "SELECT request_id, event_id, entity_ref, policy_id, policy_hash, request_hash, currency, status, created_at \
                     FROM approval_requests WHERE entity_ref = $1 AND status = 'pending' FOR UPDATE",
                )
                .bind(entity_ref)
                .fetch_optional(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?
                .map(TryInto::try_into)
                .transpose()
            }
        }
    }

    async fn find_decision(
        &self,
        request_id: Uuid,
        actor: &crate::types::ActorId,
    ) -> Result<Option<ApprovalDecision>, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(state
                .approval_decisions
                .lock()
                .await
                .get(&(request_id, actor.clone()))
                .cloned()),
            Backend::Postgres(pool) => {
                sqlx::query_as::<_, ApprovalDecisionRow>(
                    "SELECT decision_id, request_id, actor, approved, decided_at, reason \
                     FROM approval_decisions WHERE request_id = $1 AND actor = $2",
                )
                .bind(request_id)
                .bind(actor)
                .fetch_optional(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?
                .map(Into::into)
                .map(Ok)
                .transpose()
            }
        }
    }

    async fn persist_decision(&self, decision: &ApprovalDecision) -> Result<(), Error> {
        match &self.backend {
            Backend::Memory(state) => {
                state
                    .approval_decisions
                    .lock()
                    .await
                    .insert((decision.request_id, decision.actor.clone()), decision.clone());
                Ok(())
            }
            Backend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO approval_decisions (decision_id, request_id, actor, approved, decided_at, reason) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(decision.decision_id)
                .bind(decision.request_id)
                .bind(&decision.actor)
                .bind(decision.approved)
                .bind(decision.decided_at)
                .bind(&decision.reason)
                .execute(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn set_status(&self, request_id: Uuid, status: ApprovalStatus) -> Result<(), Error> {
        match &self.backend {
            Backend::Memory(state) => {
                if let Some(r) = state.approval_requests.lock().await.get_mut(&request_id) {
                    r.status = status;
                }
                Ok(())
            }
            Backend::Postgres(pool) => {
                sqlx::query("UPDATE approval_requests SET status = $1 WHERE request_id = $2")
                    .bind(approval_status_str(status))
                    .bind(request_id)
                    .execute(pool)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            }
        }
    }
}

fn approval_status_str(status: ApprovalStatus) -> &'static str {
    match status {
        ApprovalStatus::Pending => "pending",
        ApprovalStatus::Approved => "approved",
        ApprovalStatus::Rejected => "rejected",
        ApprovalStatus::Expired => "expired",
    }
}

fn approval_status_from_str(raw: &str) -> Result<ApprovalStatus, Error> {
    match raw {
        "pending" => Ok(ApprovalStatus::Pending),
        "approved" => Ok(ApprovalStatus::Approved),
        "rejected" => Ok(ApprovalStatus::Rejected),
        "expired" => Ok(ApprovalStatus::Expired),
        other => Err(Error::Storage(format!("unknown approval status '{other}'"))),
    }
}

#[derive(sqlx::FromRow)]
struct ApprovalRequestRow {
    request_id: Uuid,
    event_id: Uuid,
    entity_ref: String,
    policy_id: String,
    policy_hash: String,
    request_hash: String,
    currency: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ApprovalRequestRow> for ApprovalRequest {
    type Error = Error;

    fn try_from(row: ApprovalRequestRow) -> Result<Self, Error> {
        Ok(ApprovalRequest {
            request_id: row.request_id,
            event_id: row.event_id,
            entity_ref: row.entity_ref,
            policy_id: row.policy_id,
            policy_hash: row.policy_hash,
            request_hash: row.request_hash,
            currency: row.currency,
            status: approval_status_from_str(&row.status)?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ApprovalDecisionRow {
    decision_id: Uuid,
    request_id: Uuid,
    actor: String,
    approved: bool,
    decided_at: DateTime<Utc>,
    reason: Option<String>,
}

impl From<ApprovalDecisionRow> for ApprovalDecision {
    fn from(row: ApprovalDecisionRow) -> Self {
        ApprovalDecision {
            decision_id: row.decision_id,
            request_id: row.request_id,
            actor: row.actor,
            approved: row.approved,
            decided_at: row.decided_at,
            reason: row.reason,
        }
    }
}

#[async_trait]
impl crate::coordinator::OutcomeStore for PersistentLedger {
    async fn lock_and_record(&self, event_id: EventId, outcome: &InterpretationOutcome) -> Result<(), Error> {
        match &self.backend {
            Backend::Memory(state) => {
                state.outcomes.lock().await.insert(event_id, outcome.clone());
                Ok(())
            }
            Backend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO ingested_events (event_id, payload_hash, outcome) VALUES ($1, '', $2) \
                     ON CONFLICT (event_id) DO UPDATE SET outcome = $2",
                )
                .bind(event_id)
                .bind(serde_json::to_value(outcome).map_err(|e| Error::Serialization(e.to_string()))?)
                .execute(pool)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn find_outcome(&self, event_id: EventId) -> Result<Option<InterpretationOutcome>, Error> {
        match &self.backend {
            Backend::Memory(state) => Ok(state.outcomes.lock().await.get(&event_id).cloned()),
            Backend::Postgres(pool) => {
                let row: Option<(Value,)> =
                    sqlx::query_as("SELECT outcome FROM ingested_events WHERE event_id = $1")
                        .bind(event_id)
                        .fetch_optional(pool)
                        .await
                        .map_err(|e| Error::Storage(e.to_string()))?;
                row.map(|(v,)| serde_json::from_value(v).map_err(|e| Error::Serialization(e.to_string())))
                    .transpose()
            }
        }
    }
}
