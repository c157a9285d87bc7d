//! Approval service: tamper-evident requests, policy snapshotting, and one
//! decision per (request, actor) (AL-1 through AL-11, spec §4.11).

use crate::audit::canonical_bytes;
use crate::error::Error;
use crate::types::{ActorId, ApprovalDecision, ApprovalRequest, ApprovalStatus, EventId};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn persist_request(&self, request: &ApprovalRequest) -> Result<(), Error>;
    async fn find_request(&self, request_id: Uuid) -> Result<Option<ApprovalRequest>, Error>;
    /// Row-locked: enforces AL-10's partial unique index (one pending request per
    /// entity) at the storage layer; returns the existing pending request if one
    /// is already open for `entity_ref`.
    async fn lock_pending_for_entity(&self, entity_ref: &str) -> Result<Option<ApprovalRequest>, Error>;
    async fn find_decision(&self, request_id: Uuid, actor: &ActorId) -> Result<Option<ApprovalDecision>, Error>;
    async fn persist_decision(&self, decision: &ApprovalDecision) -> Result<(), Error>;
    async fn set_status(&self, request_id: Uuid, status: ApprovalStatus) -> Result<(), Error>;
}

pub struct ApprovalService<'a, S: ApprovalStore> {
    store: &'a S,
}

impl<'a, S: ApprovalStore> ApprovalService<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    #[tracing::instrument(level = "info", skip(self, payload), fields(event_id = %event_id))]
    pub async fn create_request(
        &self,
        event_id: EventId,
        entity_ref: &str,
        policy_id: &str,
        policy_hash: &str,
        payload: &Value,
    ) -> Result<ApprovalRequest, Error> {
        if let Some(existing) = self.store.lock_pending_for_entity(entity_ref).await? {
            tracing::info!(entity_ref, "reusing existing pending approval request");
            return Ok(existing);
        }

        let currency = coherent_currency(payload)?;
        let request_hash = request_hash(event_id, entity_ref, policy_id, payload);

        let request = ApprovalRequest {
            request_id: Uuid::new_v4(),
            event_id,
            entity_ref: entity_ref.to_string(),
            policy_id: policy_id.to_string(),
            policy_hash: policy_hash.to_string(),
            request_hash,
            currency,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
        };

        self.store.persist_request(&request).await?;
        Ok(request)
    }

    /// Records a decision for `(request_id, actor)`; a second decision by the same
    /// actor on the same request is rejected (AL-7). Rejects if the current policy
    /// hash has downgraded since the request was created (AL-5); upgrades are
    /// permitted and merely audit-logged by the caller.
    #[tracing::instrument(level = "info", skip(self, reason))]
    pub async fn record_decision(
        &self,
        request_id: Uuid,
        actor: ActorId,
        approved: bool,
        current_policy_hash: &str,
        policy_is_downgrade: impl Fn(&str, &str) -> bool,
        reason: Option<String>,
    ) -> Result<(ApprovalRequest, ApprovalDecision), Error> {
        let request = self
            .store
            .find_request(request_id)
            .await?
            .ok_or_else(|| Error::InvariantViolation(format!("no approval request '{request_id}'")))?;

        if self.store.find_decision(request_id, &actor).await?.is_some() {
            return Err(Error::InvariantViolation(format!(
                "actor '{actor}' has already decided on request '{request_id}'"
            )));
        }

        let next_status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        request.status.transition_to(next_status)?;

        if approved && policy_is_downgrade(&request.policy_hash, current_policy_hash) {
            return Err(Error::InvariantViolation(format!(
                "policy for request '{request_id}' was downgraded since creation; approval rejected"
            )));
        }

        let decision = ApprovalDecision {
            decision_id: Uuid::new_v4(),
            request_id,
            actor,
            approved,
            decided_at: Utc::now(),
            reason,
        };

        self.store.persist_decision(&decision).await?;
        self.store.set_status(request_id, next_status).await?;

        Ok((
            ApprovalRequest {
                status: next_status,
                ..request
            },
            decision,
        ))
    }
}

/// Walks `payload` for every `"currency"` field and requires they all agree
/// (AL-3): a request spanning two currencies is ambiguous about which ledger
/// entries it should ultimately produce, so it is rejected at creation rather
/// than left to surface as a balancing error later.
fn coherent_currency(payload: &Value) -> Result<String, Error> {
    let mut found: Vec<String> = Vec::new();
    collect_currencies(payload, &mut found);
    found.sort();
    found.dedup();
    match found.len() {
        0 => Ok(String::new()),
        1 => Ok(found.into_iter().next().unwrap()),
        _ => Err(Error::CurrencyIncoherent(found)),
    }
}

fn collect_currencies(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "currency" {
                    if let Value::String(code) = child {
                        found.push(code.clone());
                    }
                }
                collect_currencies(child, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_currencies(item, found);
            }
        }
        _ => {}
    }
}

/// Tamper-evident hash over the immutable facts of an approval request, computed
/// the same way audit event hashes are (canonical JSON over blake3).
fn request_hash(event_id: EventId, entity_ref: &str, policy_id: &str, payload: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(event_id.as_bytes());
    hasher.update(entity_ref.as_bytes());
    hasher.update(policy_id.as_bytes());
    hasher.update(&canonical_bytes(payload));
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct InMemoryApprovalStore {
        requests: Mutex<HashMap<Uuid, ApprovalRequest>>,
        pending_by_entity: Mutex<HashMap<String, Uuid>>,
        decisions: Mutex<HashMap<(Uuid, ActorId), ApprovalDecision>>,
    }

    #[async_trait]
    impl ApprovalStore for InMemoryApprovalStore {
        async fn persist_request(&self, request: &ApprovalRequest) -> Result<(), Error> {
            self.requests.lock().await.insert(request.request_id, request.clone());
            self.pending_by_entity
                .lock()
                .await
                .insert(request.entity_ref.clone(), request.request_id);
            Ok(())
        }

        async fn find_request(&self, request_id: Uuid) -> Result<Option<ApprovalRequest>, Error> {
            Ok(self.requests.lock().await.get(&request_id).cloned())
        }

        async fn lock_pending_for_entity(&self, entity_ref: &str) -> Result<Option<ApprovalRequest>, Error> {
            let pending = self.pending_by_entity.lock().await;
            if let Some(request_id) = pending.get(entity_ref) {
                let requests = self.requests.lock().await;
                if let Some(r) = requests.get(request_id) {
                    if r.status == ApprovalStatus::Pending {
                        return Ok(Some(r.clone()));
                    }
                }
            }
            Ok(None)
        }

        async fn find_decision(&self, request_id: Uuid, actor: &ActorId) -> Result<Option<ApprovalDecision>, Error> {
            Ok(self.decisions.lock().await.get(&(request_id, actor.clone())).cloned())
        }

        async fn persist_decision(&self, decision: &ApprovalDecision) -> Result<(), Error> {
            self.decisions
                .lock()
                .await
                .insert((decision.request_id, decision.actor.clone()), decision.clone());
            Ok(())
        }

        async fn set_status(&self, request_id: Uuid, status: ApprovalStatus) -> Result<(), Error> {
            if let Some(r) = self.requests.lock().await.get_mut(&request_id) {
                r.status = status;
            }
            Ok(())
        }
    }

    fn no_downgrade(_prev: &str, _current: &str) -> bool {
        false
    }

    #[tokio::test]
    async fn create_request_then_approve() {
        let store = InMemoryApprovalStore::default();
        let service = ApprovalService::new(&store);
        let request = service
            .create_request(Uuid::new_v4(), "inv-1", "p1", "hash-1", &json!({"amount": 5000, "currency": "USD"}))
            .await
            .unwrap();

        let (updated, decision) = service
            .record_decision(request.request_id, "approver-1".to_string(), true, "hash-1", no_downgrade, None)
            .await
            .unwrap();
        assert_eq!(updated.status, ApprovalStatus::Approved);
        assert!(decision.approved);
    }

    #[tokio::test]
    async fn same_actor_cannot_decide_twice() {
        let store = InMemoryApprovalStore::default();
        let service = ApprovalService::new(&store);
        let request = service
            .create_request(Uuid::new_v4(), "inv-3", "p1", "hash-1", &json!({"currency": "USD"}))
            .await
            .unwrap();
        service
            .record_decision(request.request_id, "approver-1".to_string(), true, "hash-1", no_downgrade, None)
            .await
            .unwrap();
        let second = service
            .record_decision(request.request_id, "approver-1".to_string(), true, "hash-1", no_downgrade, None)
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn duplicate_pending_request_for_same_entity_is_reused() {
        let store = InMemoryApprovalStore::default();
        let service = ApprovalService::new(&store);
        let first = service
            .create_request(Uuid::new_v4(), "inv-4", "p1", "hash-1", &json!({"currency": "USD"}))
            .await
            .unwrap();
        let second = service
            .create_request(Uuid::new_v4(), "inv-4", "p1", "hash-1", &json!({"currency": "USD"}))
            .await
            .unwrap();
        assert_eq!(first.request_id, second.request_id);
    }

    #[tokio::test]
    async fn policy_downgrade_rejects_approval() {
        let store = InMemoryApprovalStore::default();
        let service = ApprovalService::new(&store);
        let request = service
            .create_request(Uuid::new_v4(), "inv-5", "p1", "hash-1", &json!({"currency": "USD"}))
            .await
            .unwrap();
        let result = service
            .record_decision(
                request.request_id,
                "approver-1".to_string(),
                true,
                "hash-2",
                |_prev, _current| true,
                None,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn incoherent_currencies_reject_creation() {
        let store = InMemoryApprovalStore::default();
        let service = ApprovalService::new(&store);
        let result = service
            .create_request(
                Uuid::new_v4(),
                "inv-6",
                "p1",
                "hash-1",
                &json!({"lines": [{"currency": "USD"}, {"currency": "EUR"}]}),
            )
            .await;
        assert!(matches!(result, Err(Error::CurrencyIncoherent(_))));
    }

    #[tokio::test]
    async fn coherent_currencies_across_nested_payload_are_accepted() {
        let store = InMemoryApprovalStore::default();
        let service = ApprovalService::new(&store);
        let request = service
            .create_request(
                Uuid::new_v4(),
                "inv-7",
                "p1",
                "hash-1",
                &json!({"currency": "USD", "lines": [{"currency": "USD"}]}),
            )
            .await
            .unwrap();
        assert_eq!(request.currency, "USD");
    }
}
