//! Interpretation coordinator and outcome recorder (spec §4.10).
//!
//! Grounded on the teacher's strict accountability -> risk -> route pipeline and
//! its explicit stage-order state machine: each step is audit-logged before the
//! next begins, and the machine rejects any attempt to skip or reorder a stage.

use crate::approval::{ApprovalService, ApprovalStore};
use crate::engine::{EngineDispatcher, EngineRegistry};
use crate::error::Error;
use crate::ingestor::{IngestOutcome, IngestStore, Ingestor};
use crate::journal::{AccountingIntent, IntentLine, JournalStore, JournalWriter, LedgerIntent, SubledgerCheck};
use crate::money::{Currency, Money, Side};
use crate::period::{PeriodService, PeriodStore, PostingKind};
use crate::policy::{CompiledPolicy, CompiledPolicyPack, Meaning, MeaningBuilder, PolicySelector};
use crate::sequence::{SequenceService, SequenceStore};
use crate::snapshot::ReferenceSnapshot;
use crate::subledger::{SubledgerReconciler, SubledgerStore};
use crate::types::{ActorId, Event, EventId, InterpretationOutcome};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Pipeline stages, in the only order they may occur. `advance` enforces this
/// order; a coordinator that tries to jump from `Ingested` straight to
/// `JournalWritten` is a programming error, not a recoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Ingested,
    PolicySelected,
    MeaningBuilt,
    EnginesDispatched,
    IntentBuilt,
    JournalWritten,
    OutcomeRecorded,
}

impl PipelineStage {
    fn order(self) -> u8 {
        match self {
            PipelineStage::Ingested => 0,
            PipelineStage::PolicySelected => 1,
            PipelineStage::MeaningBuilt => 2,
            PipelineStage::EnginesDispatched => 3,
            PipelineStage::IntentBuilt => 4,
            PipelineStage::JournalWritten => 5,
            PipelineStage::OutcomeRecorded => 6,
        }
    }
}

/// Tracks the current stage of one event's interpretation and rejects
/// out-of-order advancement.
pub struct PipelineStageMachine {
    current: Option<PipelineStage>,
}

impl PipelineStageMachine {
    pub fn new() -> Self {
        Self { current: None }
    }

    pub fn current(&self) -> Option<PipelineStage> {
        self.current
    }

    pub fn advance(&mut self, next: PipelineStage) -> Result<(), Error> {
        let expected_order = self.current.map(|s| s.order() + 1).unwrap_or(0);
        if next.order() != expected_order {
            return Err(Error::InvariantViolation(format!(
                "pipeline stage out of order: at {:?}, attempted {:?}",
                self.current, next
            )));
        }
        self.current = Some(next);
        Ok(())
    }
}

impl Default for PipelineStageMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximum number of FAILED -> RETRYING cycles before an event is moved to
/// ABANDONED rather than retried forever.
pub const MAX_RETRIES: u32 = 5;

/// Records exactly one terminal [`InterpretationOutcome`] per event (P15) and
/// implements the retry lifecycle: FAILED -> RETRYING -> POSTED | FAILED, and
/// FAILED -> ABANDONED once [`MAX_RETRIES`] is exceeded.
pub struct OutcomeRecorder<'a, S: OutcomeStore> {
    store: &'a S,
}

#[async_trait::async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Row-locks the outcome slot for `event_id` before writing, so a concurrent
    /// retry attempt can never record a second outcome for the same event (P15).
    async fn lock_and_record(&self, event_id: EventId, outcome: &InterpretationOutcome) -> Result<(), Error>;
    async fn find_outcome(&self, event_id: EventId) -> Result<Option<InterpretationOutcome>, Error>;
}

impl<'a, S: OutcomeStore> OutcomeRecorder<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    #[tracing::instrument(level = "info", skip(self), fields(event_id = %event_id))]
    pub async fn record(&self, event_id: EventId, outcome: InterpretationOutcome) -> Result<(), Error> {
        if self.store.find_outcome(event_id).await?.is_some() {
            return Err(Error::InvariantViolation(format!(
                "event '{event_id}' already has a recorded outcome"
            )));
        }
        self.store.lock_and_record(event_id, &outcome).await?;
        tracing::info!(?outcome, "outcome recorded");
        Ok(())
    }

    /// Given the previous retry count, decides the next outcome for a failed
    /// attempt: another `Failed` with `retry_count + 1` if under the cap, or
    /// `Abandoned` once the cap is exceeded.
    pub fn next_failure_outcome(previous_retry_count: u32, code: &str, message: &str) -> InterpretationOutcome {
        let retry_count = previous_retry_count + 1;
        if retry_count > MAX_RETRIES {
            InterpretationOutcome::Abandoned {
                code: code.to_string(),
                message: message.to_string(),
                retry_count,
            }
        } else {
            InterpretationOutcome::Failed {
                code: code.to_string(),
                message: message.to_string(),
                retry_count,
            }
        }
    }
}

/// Everything the coordinator needs from storage to drive one event through the
/// full pipeline, in one place so `Coordinator` can be generic over a single
/// combined backend rather than threading seven separate type parameters.
pub trait PostingStore:
    IngestStore + PeriodStore + JournalStore + SequenceStore + SubledgerStore + OutcomeStore + ApprovalStore
{
}

impl<T> PostingStore for T where
    T: IngestStore + PeriodStore + JournalStore + SequenceStore + SubledgerStore + OutcomeStore + ApprovalStore
{
}

/// Drives one event from raw ingest through to a recorded [`InterpretationOutcome`]
/// (spec §4.10): ingest -> select policy -> build meaning (guards) -> dispatch
/// required engines -> build the accounting intent -> resolve roles and write the
/// journal -> record the outcome exactly once. Each step advances the
/// [`PipelineStageMachine`] in order; a guard that blocks short-circuits into a
/// pending approval request instead of a journal write.
pub struct Coordinator<'a, S: PostingStore> {
    store: &'a S,
    policies: &'a CompiledPolicyPack,
    engines: &'a EngineRegistry,
    snapshot: ReferenceSnapshot,
    subledger_tolerance: Decimal,
}

impl<'a, S: PostingStore> Coordinator<'a, S> {
    pub fn new(
        store: &'a S,
        policies: &'a CompiledPolicyPack,
        engines: &'a EngineRegistry,
        snapshot: ReferenceSnapshot,
        subledger_tolerance: Decimal,
    ) -> Self {
        Self {
            store,
            policies,
            engines,
            snapshot,
            subledger_tolerance,
        }
    }

    /// The single entry point for an externally received event (spec §6): ingest
    /// it, interpret it, and record its terminal outcome. Safe to call more than
    /// once with the same `event_id`/payload — the ingestor short-circuits to the
    /// previously recorded outcome rather than re-running interpretation (R3).
    #[tracing::instrument(level = "info", skip(self, event), fields(event_id = %event.event_id))]
    pub async fn post_event_from_external(
        &self,
        event: Event,
        actor: ActorId,
    ) -> Result<InterpretationOutcome, Error> {
        self.post_event_at(event, actor, Utc::now()).await
    }

    /// Same as [`Self::post_event_from_external`], but with the journal's
    /// `posted_at` timestamp supplied by the caller instead of read from the wall
    /// clock. [`crate::replay::replay_all`] drives this with a timestamp derived
    /// from the event itself, so replaying the same log twice produces
    /// byte-identical entries (R24); the public entry point above is just this
    /// with `Utc::now()`.
    #[tracing::instrument(level = "info", skip(self, event), fields(event_id = %event.event_id))]
    pub async fn post_event_at(
        &self,
        event: Event,
        actor: ActorId,
        posted_at: chrono::DateTime<Utc>,
    ) -> Result<InterpretationOutcome, Error> {
        let mut stage = PipelineStageMachine::new();

        let ingestor = Ingestor::new(self.store);
        let ingest_outcome = ingestor.ingest(event).await?;
        stage.advance(PipelineStage::Ingested)?;

        let event = match ingest_outcome {
            IngestOutcome::Duplicate(outcome) => return Ok(outcome),
            IngestOutcome::Fresh(event) => event,
        };

        let outcome = match self.interpret(&event, &actor, &mut stage, posted_at).await {
            Ok(outcome) => outcome,
            Err(err) => self.outcome_for_failure(&err),
        };

        let recorder = OutcomeRecorder::new(self.store);
        recorder.record(event.event_id, outcome.clone()).await?;
        stage.advance(PipelineStage::OutcomeRecorded)?;
        Ok(outcome)
    }

    async fn interpret(
        &self,
        event: &Event,
        actor: &ActorId,
        stage: &mut PipelineStageMachine,
        posted_at: chrono::DateTime<Utc>,
    ) -> Result<InterpretationOutcome, Error> {
        let selector = PolicySelector::new(self.policies);
        let policy = selector.select(&event.event_type, &event.payload, event.occurred_at)?;
        stage.advance(PipelineStage::PolicySelected)?;

        let meaning = match MeaningBuilder::build(policy, &event.payload) {
            Ok(meaning) => meaning,
            Err(Error::GuardBlocked { reason_code, message }) => {
                tracing::info!(reason_code, message, "guard blocked posting, requesting approval");
                let approvals = ApprovalService::new(self.store);
                let request = approvals
                    .create_request(
                        event.event_id,
                        &event.idempotency_key,
                        &policy.policy_id,
                        policy.compilation_receipt.as_deref().unwrap_or_default(),
                        &event.payload,
                    )
                    .await?;
                return Ok(InterpretationOutcome::PendingApproval {
                    request_id: request.request_id,
                });
            }
            Err(other) => return Err(other),
        };
        stage.advance(PipelineStage::MeaningBuilt)?;

        let engine_ids: Vec<(String, Value)> = policy
            .required_engines
            .iter()
            .map(|id| (id.clone(), policy.engine_parameters.get(id).cloned().unwrap_or(Value::Null)))
            .collect();
        let dispatcher = EngineDispatcher::new(self.engines);
        let _traces = dispatcher.dispatch_all(&engine_ids, &event.payload)?;
        stage.advance(PipelineStage::EnginesDispatched)?;

        let intent = self.build_intent(event, policy, &meaning)?;
        stage.advance(PipelineStage::IntentBuilt)?;

        let periods = PeriodService::new(self.store);
        let period = periods.find_period(event.effective_date).await?;
        periods.assert_open(&period, PostingKind::Ordinary)?;

        let sequences = SequenceService::new(self.store);
        let subledgers = SubledgerReconciler::new(self.store);
        let writer = JournalWriter::new(self.store, &sequences, &subledgers);
        let entries = writer
            .post(
                &intent,
                &policy.role_bindings,
                &self.snapshot,
                &self.snapshot,
                actor,
                posted_at,
            )
            .await?;
        stage.advance(PipelineStage::JournalWritten)?;

        let primary = entries
            .first()
            .ok_or_else(|| Error::InvariantViolation(format!("policy '{}' produced no journal entries", policy.policy_id)))?;
        Ok(InterpretationOutcome::Posted { entry_id: primary.entry_id })
    }

    /// Translates a policy's declared ledger effects into a concrete
    /// [`AccountingIntent`]: one balanced debit/credit pair per [`LedgerEffect`],
    /// at the quantity and currency [`MeaningBuilder`] extracted from the payload.
    fn build_intent(&self, event: &Event, policy: &CompiledPolicy, meaning: &Meaning) -> Result<AccountingIntent, Error> {
        if policy.ledger_effects.is_empty() {
            return Err(Error::InvariantViolation(format!(
                "policy '{}' declares no ledger effects",
                policy.policy_id
            )));
        }

        let currency = extract_currency(&event.payload)?;
        let money = Money::new(meaning.quantity, currency.clone())?;

        let mut ledger_intents = Vec::with_capacity(policy.ledger_effects.len());
        let mut subledger_checks = Vec::new();
        for effect in &policy.ledger_effects {
            ledger_intents.push(LedgerIntent {
                ledger_id: effect.ledger_id.clone(),
                lines: vec![
                    IntentLine {
                        role: effect.debit_role.clone(),
                        side: Side::Debit,
                        money: money.clone(),
                        is_rounding_line: false,
                        metadata: BTreeMap::new(),
                    },
                    IntentLine {
                        role: effect.credit_role.clone(),
                        side: Side::Credit,
                        money: money.clone(),
                        is_rounding_line: false,
                        metadata: BTreeMap::new(),
                    },
                ],
            });

            if effect.ledger_id != "gl" && crate::subledger::DEFAULT_CLOSE_ORDER.contains(&effect.ledger_id.as_str()) {
                subledger_checks.push(SubledgerCheck {
                    subledger_type: effect.ledger_id.clone(),
                    currency: currency.code().to_string(),
                    tolerance: self.subledger_tolerance,
                });
            }
        }

        Ok(AccountingIntent {
            event_id: event.event_id,
            policy_id: policy.policy_id.clone(),
            effective_date: event.effective_date,
            ledger_intents,
            subledger_checks,
        })
    }

    /// Classifies a pipeline error as a hard rejection (caller's input or policy
    /// was bad; retrying with the same payload would only fail again) or a
    /// retryable failure, feeding the retry count into [`OutcomeRecorder`]'s
    /// FAILED/ABANDONED lifecycle.
    fn outcome_for_failure(&self, err: &Error) -> InterpretationOutcome {
        if is_rejection(err) {
            InterpretationOutcome::Rejected {
                code: err.code().to_string(),
                message: err.to_string(),
            }
        } else {
            OutcomeRecorder::<S>::next_failure_outcome(0, err.code(), &err.to_string())
        }
    }
}

fn is_rejection(err: &Error) -> bool {
    matches!(
        err,
        Error::GuardRejected { .. }
            | Error::ProfileNotFound(_)
            | Error::AmbiguousDispatch(_, _)
            | Error::Unbalanced { .. }
            | Error::MissingRoleBinding(_)
            | Error::InvalidQuantity(_)
            | Error::NegativeAmount(_)
            | Error::UnrecognizedCurrency(_)
            | Error::InvalidLinkType { .. }
            | Error::PeriodClosed(_)
            | Error::PeriodClosing(_)
            | Error::AdjustmentsNotAllowed(_)
            | Error::EngineParamInvalid { .. }
    )
}

fn extract_currency(payload: &Value) -> Result<Currency, Error> {
    let code = payload
        .get("currency")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidQuantity("payload has no top-level 'currency' field".into()))?;
    Currency::new(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct InMemoryOutcomeStore {
        outcomes: Mutex<HashMap<EventId, InterpretationOutcome>>,
    }

    #[async_trait::async_trait]
    impl OutcomeStore for InMemoryOutcomeStore {
        async fn lock_and_record(&self, event_id: EventId, outcome: &InterpretationOutcome) -> Result<(), Error> {
            self.outcomes.lock().await.insert(event_id, outcome.clone());
            Ok(())
        }

        async fn find_outcome(&self, event_id: EventId) -> Result<Option<InterpretationOutcome>, Error> {
            Ok(self.outcomes.lock().await.get(&event_id).cloned())
        }
    }

    #[test]
    fn stage_machine_rejects_skipping_a_stage() {
        let mut machine = PipelineStageMachine::new();
        machine.advance(PipelineStage::Ingested).unwrap();
        let result = machine.advance(PipelineStage::MeaningBuilt);
        assert!(result.is_err());
    }

    #[test]
    fn stage_machine_accepts_in_order_advancement() {
        let mut machine = PipelineStageMachine::new();
        machine.advance(PipelineStage::Ingested).unwrap();
        machine.advance(PipelineStage::PolicySelected).unwrap();
        machine.advance(PipelineStage::MeaningBuilt).unwrap();
        assert_eq!(machine.current(), Some(PipelineStage::MeaningBuilt));
    }

    #[tokio::test]
    async fn outcome_recorded_exactly_once() {
        let store = InMemoryOutcomeStore::default();
        let recorder = OutcomeRecorder::new(&store);
        let event_id = Uuid::new_v4();
        recorder
            .record(event_id, InterpretationOutcome::Posted { entry_id: Uuid::new_v4() })
            .await
            .unwrap();
        let second = recorder
            .record(event_id, InterpretationOutcome::Posted { entry_id: Uuid::new_v4() })
            .await;
        assert!(second.is_err());
    }

    #[test]
    fn retry_count_exceeding_max_is_abandoned() {
        let outcome = OutcomeRecorder::<InMemoryOutcomeStore>::next_failure_outcome(MAX_RETRIES, "E", "m");
        assert!(matches!(outcome, InterpretationOutcome::Abandoned { .. }));
    }

    #[test]
    fn retry_count_under_max_stays_failed() {
        let outcome = OutcomeRecorder::<InMemoryOutcomeStore>::next_failure_outcome(0, "E", "m");
        assert!(matches!(outcome, InterpretationOutcome::Failed { .. }));
    }

    mod posting_pipeline {
        use super::*;
        use crate::money::Money;
        use crate::policy::guard::{GuardExpr, GuardRule, GuardSeverity};
        use crate::policy::registry::{LedgerEffect, RoleBindingMap, VarianceDisposition};
        use crate::types::{
            ApprovalDecision, ApprovalRequest, ApprovalStatus, EntryId, FiscalPeriod, JournalEntry, PeriodStatus,
        };
        use chrono::DateTime;
        use serde_json::json;
        use std::collections::BTreeMap;

        #[derive(Default)]
        struct InMemoryPostingStore {
            ingested_hashes: Mutex<HashMap<EventId, String>>,
            ingested_by_key: Mutex<HashMap<String, EventId>>,
            periods: Mutex<HashMap<Uuid, FiscalPeriod>>,
            posted_entries: Mutex<HashMap<EventId, Vec<EntryId>>>,
            entries_by_id: Mutex<HashMap<EntryId, JournalEntry>>,
            sequences: Mutex<HashMap<String, i64>>,
            subledger_balances: Mutex<HashMap<(String, String), Decimal>>,
            control_balances: Mutex<HashMap<(String, String), Decimal>>,
            outcomes: Mutex<HashMap<EventId, InterpretationOutcome>>,
            approval_requests: Mutex<HashMap<Uuid, ApprovalRequest>>,
            approval_pending_by_entity: Mutex<HashMap<String, Uuid>>,
            approval_decisions: Mutex<HashMap<(Uuid, ActorId), ApprovalDecision>>,
        }

        #[async_trait::async_trait]
        impl IngestStore for InMemoryPostingStore {
            async fn find_by_event_id(
                &self,
                event_id: EventId,
            ) -> Result<Option<(String, InterpretationOutcome)>, Error> {
                let hashes = self.ingested_hashes.lock().await;
                let Some(hash) = hashes.get(&event_id) else {
                    return Ok(None);
                };
                let outcome = self.outcomes.lock().await.get(&event_id).cloned().unwrap_or(InterpretationOutcome::Failed {
                    code: "PENDING".into(),
                    message: "interpretation in progress".into(),
                    retry_count: 0,
                });
                Ok(Some((hash.clone(), outcome)))
            }

            async fn lock_idempotency_key(
                &self,
                idempotency_key: &str,
                event_id: EventId,
            ) -> Result<Option<InterpretationOutcome>, Error> {
                let keys = self.ingested_by_key.lock().await;
                if let Some(existing) = keys.get(idempotency_key) {
                    if *existing != event_id {
                        return self.find_by_event_id(*existing).await.map(|r| r.map(|(_, o)| o));
                    }
                }
                Ok(None)
            }

            async fn record_ingested(&self, event: &Event, payload_hash: &str) -> Result<(), Error> {
                self.ingested_hashes.lock().await.insert(event.event_id, payload_hash.to_string());
                self.ingested_by_key.lock().await.insert(event.idempotency_key.clone(), event.event_id);
                Ok(())
            }
        }

        #[async_trait::async_trait]
        impl PeriodStore for InMemoryPostingStore {
            async fn find_period(&self, effective_date: DateTime<Utc>) -> Result<Option<FiscalPeriod>, Error> {
                let periods = self.periods.lock().await;
                Ok(periods
                    .values()
                    .find(|p| p.starts_at <= effective_date && effective_date < p.ends_at)
                    .cloned())
            }

            async fn lock_period(&self, period_id: Uuid) -> Result<FiscalPeriod, Error> {
                self.periods
                    .lock()
                    .await
                    .get(&period_id)
                    .cloned()
                    .ok_or_else(|| Error::InvariantViolation("no such period".into()))
            }

            async fn set_status(&self, period_id: Uuid, status: PeriodStatus) -> Result<(), Error> {
                if let Some(p) = self.periods.lock().await.get_mut(&period_id) {
                    p.status = status;
                }
                Ok(())
            }
        }

        #[async_trait::async_trait]
        impl JournalStore for InMemoryPostingStore {
            async fn lock_for_post(&self, event_id: EventId) -> Result<Option<Vec<EntryId>>, Error> {
                Ok(self.posted_entries.lock().await.get(&event_id).cloned())
            }

            async fn persist_entries(&self, entries: &[JournalEntry]) -> Result<(), Error> {
                if let Some(first) = entries.first() {
                    let ids = entries.iter().map(|e| e.entry_id).collect();
                    self.posted_entries.lock().await.insert(first.event_id, ids);
                }
                self.entries_by_id.lock().await.extend(entries.iter().map(|e| (e.entry_id, e.clone())));
                Ok(())
            }

            async fn find_entry(&self, entry_id: EntryId) -> Result<Option<JournalEntry>, Error> {
                Ok(self.entries_by_id.lock().await.get(&entry_id).cloned())
            }
        }

        #[async_trait::async_trait]
        impl SequenceStore for InMemoryPostingStore {
            async fn lock_and_increment(&self, counter_name: &str) -> Result<i64, Error> {
                let mut counters = self.sequences.lock().await;
                let entry = counters.entry(counter_name.to_string()).or_insert(0);
                *entry += 1;
                Ok(*entry)
            }

            async fn peek(&self, counter_name: &str) -> Result<i64, Error> {
                Ok(*self.sequences.lock().await.get(counter_name).unwrap_or(&0))
            }
        }

        #[async_trait::async_trait]
        impl SubledgerStore for InMemoryPostingStore {
            async fn subledger_balance(&self, subledger_type: &str, currency: &str) -> Result<Decimal, Error> {
                Ok(*self
                    .subledger_balances
                    .lock()
                    .await
                    .get(&(subledger_type.to_string(), currency.to_string()))
                    .unwrap_or(&Decimal::ZERO))
            }

            async fn control_account_balance(&self, subledger_type: &str, currency: &str) -> Result<Decimal, Error> {
                Ok(*self
                    .control_balances
                    .lock()
                    .await
                    .get(&(subledger_type.to_string(), currency.to_string()))
                    .unwrap_or(&Decimal::ZERO))
            }

            async fn lock_and_record(&self, _record: &crate::subledger::ReconciliationRecord) -> Result<(), Error> {
                Ok(())
            }
        }

        #[async_trait::async_trait]
        impl OutcomeStore for InMemoryPostingStore {
            async fn lock_and_record(&self, event_id: EventId, outcome: &InterpretationOutcome) -> Result<(), Error> {
                self.outcomes.lock().await.insert(event_id, outcome.clone());
                Ok(())
            }

            async fn find_outcome(&self, event_id: EventId) -> Result<Option<InterpretationOutcome>, Error> {
                Ok(self.outcomes.lock().await.get(&event_id).cloned())
            }
        }

        #[async_trait::async_trait]
        impl ApprovalStore for InMemoryPostingStore {
            async fn persist_request(&self, request: &ApprovalRequest) -> Result<(), Error> {
                self.approval_requests.lock().await.insert(request.request_id, request.clone());
                self.approval_pending_by_entity
                    .lock()
                    .await
                    .insert(request.entity_ref.clone(), request.request_id);
                Ok(())
            }

            async fn find_request(&self, request_id: Uuid) -> Result<Option<ApprovalRequest>, Error> {
                Ok(self.approval_requests.lock().await.get(&request_id).cloned())
            }

            async fn lock_pending_for_entity(&self, entity_ref: &str) -> Result<Option<ApprovalRequest>, Error> {
                let pending = self.approval_pending_by_entity.lock().await;
                if let Some(request_id) = pending.get(entity_ref) {
                    let requests = self.approval_requests.lock().await;
                    if let Some(r) = requests.get(request_id) {
                        if r.status == ApprovalStatus::Pending {
                            return Ok(Some(r.clone()));
                        }
                    }
                }
                Ok(None)
            }

            async fn find_decision(&self, request_id: Uuid, actor: &ActorId) -> Result<Option<ApprovalDecision>, Error> {
                Ok(self.approval_decisions.lock().await.get(&(request_id, actor.clone())).cloned())
            }

            async fn persist_decision(&self, decision: &ApprovalDecision) -> Result<(), Error> {
                self.approval_decisions
                    .lock()
                    .await
                    .insert((decision.request_id, decision.actor.clone()), decision.clone());
                Ok(())
            }

            async fn set_status(&self, request_id: Uuid, status: ApprovalStatus) -> Result<(), Error> {
                if let Some(r) = self.approval_requests.lock().await.get_mut(&request_id) {
                    r.status = status;
                }
                Ok(())
            }
        }

        fn open_period() -> FiscalPeriod {
            FiscalPeriod {
                period_id: Uuid::new_v4(),
                starts_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc),
                ends_at: DateTime::parse_from_rfc3339("2026-02-01T00:00:00Z").unwrap().with_timezone(&Utc),
                status: PeriodStatus::Open,
                allows_adjustments: true,
            }
        }

        fn role_bindings() -> RoleBindingMap {
            let mut map = RoleBindingMap::new();
            map.insert("cash".into(), (Uuid::new_v4(), "gl".into()));
            map.insert("revenue".into(), (Uuid::new_v4(), "gl".into()));
            map
        }

        fn sale_policy(guards: Vec<GuardRule>) -> CompiledPolicy {
            CompiledPolicy {
                policy_id: "p-sale".into(),
                event_type: "invoice.issued".into(),
                economic_type: "sale".into(),
                quantity_path: "/amount".into(),
                dimension_paths: BTreeMap::new(),
                effective_from: DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z").unwrap().with_timezone(&Utc),
                effective_to: None,
                capability_tags: vec![],
                where_predicate: None,
                guards,
                role_bindings: role_bindings(),
                ledger_effects: vec![LedgerEffect {
                    ledger_id: "gl".into(),
                    debit_role: "cash".into(),
                    credit_role: "revenue".into(),
                }],
                required_engines: vec![],
                engine_parameters: BTreeMap::new(),
                variance_disposition: VarianceDisposition::Reject,
                specificity: 1,
                priority: 0,
                scope_depth: 0,
                compilation_receipt: Some("r1".into()),
            }
        }

        fn sample_event() -> Event {
            Event {
                event_id: Uuid::new_v4(),
                event_type: "invoice.issued".into(),
                idempotency_key: format!("idem-{}", Uuid::new_v4()),
                actor: "erp-1".into(),
                occurred_at: Utc::now(),
                effective_date: DateTime::parse_from_rfc3339("2026-01-15T00:00:00Z").unwrap().with_timezone(&Utc),
                payload: json!({"amount": "100.00", "currency": "USD"}),
            }
        }

        async fn coordinator_with_policy(
            store: &InMemoryPostingStore,
            policy: CompiledPolicy,
        ) -> (CompiledPolicyPack, EngineRegistry) {
            let pack = CompiledPolicyPack::load(vec![policy]).unwrap();
            let engines = EngineRegistry::new();
            let period = open_period();
            store.periods.lock().await.insert(period.period_id, period);
            (pack, engines)
        }

        #[tokio::test]
        async fn posts_a_fresh_event_end_to_end() {
            let store = InMemoryPostingStore::default();
            let (pack, engines) = coordinator_with_policy(&store, sale_policy(vec![])).await;
            let snapshot = ReferenceSnapshot::new("coa1", "roles1", pack.fingerprint.clone(), "engines1");
            let coordinator = Coordinator::new(&store, &pack, &engines, snapshot, Decimal::new(1, 2));

            let outcome = coordinator
                .post_event_from_external(sample_event(), "actor-1".to_string())
                .await
                .unwrap();
            assert!(matches!(outcome, InterpretationOutcome::Posted { .. }));
        }

        #[tokio::test]
        async fn replaying_a_posted_event_returns_the_recorded_outcome() {
            let store = InMemoryPostingStore::default();
            let (pack, engines) = coordinator_with_policy(&store, sale_policy(vec![])).await;
            let snapshot = ReferenceSnapshot::new("coa1", "roles1", pack.fingerprint.clone(), "engines1");
            let coordinator = Coordinator::new(&store, &pack, &engines, snapshot, Decimal::new(1, 2));

            let event = sample_event();
            let first = coordinator
                .post_event_from_external(event.clone(), "actor-1".to_string())
                .await
                .unwrap();
            let second = coordinator.post_event_from_external(event, "actor-1".to_string()).await.unwrap();
            assert!(matches!(first, InterpretationOutcome::Posted { .. }));
            assert_eq!(
                std::mem::discriminant(&first),
                std::mem::discriminant(&second)
            );
        }

        #[tokio::test]
        async fn a_blocking_guard_yields_a_pending_approval_outcome() {
            let blocking_guard = GuardRule {
                reason_code: "LARGE_AMOUNT".into(),
                message: "amount exceeds auto-approval threshold".into(),
                severity: GuardSeverity::Block,
                expr: GuardExpr::Lte {
                    left: Box::new(GuardExpr::Field { path: "amount".into() }),
                    right: Box::new(GuardExpr::Literal { value: json!(10) }),
                },
            };
            let store = InMemoryPostingStore::default();
            let (pack, engines) = coordinator_with_policy(&store, sale_policy(vec![blocking_guard])).await;
            let snapshot = ReferenceSnapshot::new("coa1", "roles1", pack.fingerprint.clone(), "engines1");
            let coordinator = Coordinator::new(&store, &pack, &engines, snapshot, Decimal::new(1, 2));

            let outcome = coordinator
                .post_event_from_external(sample_event(), "actor-1".to_string())
                .await
                .unwrap();
            assert!(matches!(outcome, InterpretationOutcome::PendingApproval { .. }));
            assert_eq!(store.approval_requests.lock().await.len(), 1);
        }

        #[tokio::test]
        async fn no_admissible_policy_is_a_rejected_outcome() {
            let store = InMemoryPostingStore::default();
            let pack = CompiledPolicyPack::load(vec![]).unwrap();
            let engines = EngineRegistry::new();
            let period = open_period();
            store.periods.lock().await.insert(period.period_id, period);
            let snapshot = ReferenceSnapshot::new("coa1", "roles1", pack.fingerprint.clone(), "engines1");
            let coordinator = Coordinator::new(&store, &pack, &engines, snapshot, Decimal::new(1, 2));

            let outcome = coordinator
                .post_event_from_external(sample_event(), "actor-1".to_string())
                .await
                .unwrap();
            assert!(matches!(outcome, InterpretationOutcome::Rejected { .. }));
        }

        #[tokio::test]
        async fn no_covering_period_is_a_failed_outcome_not_a_rejection() {
            let store = InMemoryPostingStore::default();
            let pack = CompiledPolicyPack::load(vec![sale_policy(vec![])]).unwrap();
            let engines = EngineRegistry::new();
            // deliberately insert no fiscal period
            let snapshot = ReferenceSnapshot::new("coa1", "roles1", pack.fingerprint.clone(), "engines1");
            let coordinator = Coordinator::new(&store, &pack, &engines, snapshot, Decimal::new(1, 2));

            let outcome = coordinator
                .post_event_from_external(sample_event(), "actor-1".to_string())
                .await
                .unwrap();
            assert!(matches!(outcome, InterpretationOutcome::Failed { .. }));
        }
    }
}
