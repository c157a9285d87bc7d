//! Reference replay harness (R24): drive a recorded event log through the
//! coordinator a second time and produce a [`ReplayReport`] fit for comparing
//! against another run or another replica.
//!
//! Grounded on [`crate::coordinator::Coordinator`] itself — replay is not a
//! separate posting path, it is the same pipeline run with the wall clock
//! pinned to each event's own `effective_date` instead of `Utc::now()`, so two
//! replays of the same log agree on every `posted_at` they produce.

use crate::coordinator::{Coordinator, PostingStore};
use crate::engine::EngineRegistry;
use crate::error::Error;
use crate::journal::JournalStore;
use crate::policy::CompiledPolicyPack;
use crate::snapshot::{canonical_ledger_hash, ReferenceSnapshot, ReplayReport};
use crate::types::{ActorId, Event, InterpretationOutcome};
use rust_decimal::Decimal;

/// Replays `events`, in order, against `policies`/`engines` under `snapshot`,
/// posting each one through the same [`Coordinator`] used for live traffic.
/// Returns a [`ReplayReport`] summarizing how many events were replayed, how
/// many journal entries resulted, and a canonical hash over those entries.
///
/// `store` is expected to be freshly seeded (an empty ledger, periods already
/// loaded) — replaying into a store that already holds some of these events
/// is legitimate (idempotent ingestion short-circuits to the prior outcome,
/// per R3) but then `entries_posted`/`canonical_hash` reflect only the
/// entries visible through `store`, not a full re-derivation.
#[tracing::instrument(level = "info", skip(store, events, policies, engines, snapshot))]
pub async fn replay_all<S: PostingStore>(
    store: &S,
    events: &[Event],
    policies: &CompiledPolicyPack,
    engines: &EngineRegistry,
    snapshot: ReferenceSnapshot,
    subledger_tolerance: Decimal,
    actor: &ActorId,
) -> Result<ReplayReport, Error> {
    let coordinator = Coordinator::new(store, policies, engines, snapshot, subledger_tolerance);

    let mut posted_entries = Vec::new();
    for event in events {
        let event_id = event.event_id;
        let posted_at = event.effective_date;
        let outcome = coordinator
            .post_event_at(event.clone(), actor.clone(), posted_at)
            .await?;
        if matches!(outcome, InterpretationOutcome::Posted { .. }) {
            // `lock_for_post` returns every entry the event fanned out to, not just
            // the primary one `InterpretationOutcome::Posted` carries, so a
            // multi-ledger intent's secondary entries still make it into the hash.
            if let Some(ids) = store.lock_for_post(event_id).await? {
                posted_entries.extend(ids);
            }
        }
    }

    let entries = collect_posted(store, &posted_entries).await?;
    let entries_posted = entries.len();
    let canonical_hash = canonical_ledger_hash(&entries);

    Ok(ReplayReport {
        events_replayed: events.len(),
        entries_posted,
        canonical_hash,
    })
}

/// Pulls the full [`crate::types::JournalEntry`] records back out of `store`
/// for every entry id replay just posted, so the canonical hash is computed
/// over actual persisted entries rather than re-deriving them in memory.
async fn collect_posted<S: PostingStore>(
    store: &S,
    entry_ids: &[crate::types::EntryId],
) -> Result<Vec<crate::types::JournalEntry>, Error> {
    let mut entries = Vec::with_capacity(entry_ids.len());
    for &entry_id in entry_ids {
        if let Some(entry) = store.find_entry(entry_id).await? {
            entries.push(entry);
        }
    }
    Ok(entries)
}
