//! Economic link graph: typed edges between artifacts, with acyclicity and
//! admissibility enforcement (L1-L5, spec §4.8).

use crate::error::Error;
use crate::types::{EconomicLink, EventId, LinkType};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Declares which (parent_type, link_type, child_type) combinations are
/// admissible (L5). Loaded from the compiled policy pack's link-type table.
pub type LinkAdmissibilityTable = HashSet<(String, LinkType, String)>;

#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn links_from_parent(&self, parent_ref: &str) -> Result<Vec<EconomicLink>, Error>;
    async fn links_to_child(&self, child_ref: &str) -> Result<Vec<EconomicLink>, Error>;
    async fn persist_link(&self, link: &EconomicLink) -> Result<(), Error>;
    /// Reads a metadata value (e.g. an amount) for an artifact reference, used by
    /// [`LinkGraph::unconsumed_value`].
    async fn artifact_metadata(&self, artifact_ref: &str, key: &str) -> Result<Option<Value>, Error>;
}

pub struct LinkGraph<'a, S: LinkStore> {
    store: &'a S,
    admissibility: &'a LinkAdmissibilityTable,
    max_traversal_depth: usize,
}

impl<'a, S: LinkStore> LinkGraph<'a, S> {
    pub fn new(store: &'a S, admissibility: &'a LinkAdmissibilityTable, max_traversal_depth: usize) -> Self {
        Self {
            store,
            admissibility,
            max_traversal_depth,
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn establish_link(
        &self,
        parent_ref: &str,
        parent_type: &str,
        child_ref: &str,
        child_type: &str,
        link_type: LinkType,
        creating_event_id: EventId,
    ) -> Result<EconomicLink, Error> {
        if parent_ref == child_ref {
            return Err(Error::LinkSelf(parent_ref.to_string()));
        }

        if !self.admissibility.contains(&(parent_type.to_string(), link_type, child_type.to_string())) {
            return Err(Error::InvalidLinkType {
                link_type: format!("{link_type:?}"),
                parent_type: parent_type.to_string(),
                child_type: child_type.to_string(),
            });
        }

        if link_type.is_exclusive_child() {
            let existing = self.store.links_from_parent(parent_ref).await?;
            if existing.iter().any(|l| l.link_type == link_type) {
                return Err(Error::InvariantViolation(format!(
                    "parent '{parent_ref}' already has a {link_type:?} child"
                )));
            }
        }

        if link_type.is_directed() {
            self.assert_acyclic(parent_ref, child_ref, link_type).await?;
        }

        let link = EconomicLink {
            link_id: Uuid::new_v4(),
            parent_ref: parent_ref.to_string(),
            parent_type: parent_type.to_string(),
            child_ref: child_ref.to_string(),
            child_type: child_type.to_string(),
            link_type,
            creating_event_id,
            created_at: Utc::now(),
        };

        self.store.persist_link(&link).await?;
        Ok(link)
    }

    /// Walks child -> parent (bounded by `max_traversal_depth`) from the candidate
    /// child, failing if it would ever reach the candidate parent — which would
    /// close a cycle (L3).
    async fn assert_acyclic(&self, parent_ref: &str, child_ref: &str, link_type: LinkType) -> Result<(), Error> {
        let mut frontier = vec![child_ref.to_string()];
        let mut visited: HashSet<String> = HashSet::new();

        for _ in 0..self.max_traversal_depth {
            if frontier.is_empty() {
                return Ok(());
            }
            let mut next_frontier = Vec::new();
            for node in frontier {
                if !visited.insert(node.clone()) {
                    continue;
                }
                if node == parent_ref {
                    return Err(Error::LinkCycle(format!("{link_type:?}")));
                }
                let outgoing = self.store.links_from_parent(&node).await?;
                for link in outgoing {
                    if link.link_type.is_directed() {
                        next_frontier.push(link.child_ref);
                    }
                }
            }
            frontier = next_frontier;
        }

        Ok(())
    }

    /// `original_amount - sum(linked children amounts)` for a parent artifact,
    /// reading the amount metadata key declared by the caller.
    pub async fn unconsumed_value(
        &self,
        parent_ref: &str,
        amount_metadata_key: &str,
    ) -> Result<rust_decimal::Decimal, Error> {
        let original = self
            .store
            .artifact_metadata(parent_ref, amount_metadata_key)
            .await?
            .ok_or_else(|| {
                Error::InvariantViolation(format!("parent '{parent_ref}' has no '{amount_metadata_key}' metadata"))
            })?;
        let original_amount = value_to_decimal(&original)?;

        let children = self.store.links_from_parent(parent_ref).await?;
        let mut consumed = rust_decimal::Decimal::ZERO;
        let mut per_child: BTreeMap<String, rust_decimal::Decimal> = BTreeMap::new();
        for link in children {
            if let Some(value) = self.store.artifact_metadata(&link.child_ref, amount_metadata_key).await? {
                let amount = value_to_decimal(&value)?;
                per_child.insert(link.child_ref.clone(), amount);
            }
        }
        for amount in per_child.values() {
            consumed += *amount;
        }

        Ok(original_amount - consumed)
    }
}

fn value_to_decimal(value: &Value) -> Result<rust_decimal::Decimal, Error> {
    use std::str::FromStr;
    match value {
        Value::Number(n) => rust_decimal::Decimal::from_str(&n.to_string())
            .map_err(|e| Error::InvalidQuantity(e.to_string())),
        Value::String(s) => {
            rust_decimal::Decimal::from_str(s).map_err(|e| Error::InvalidQuantity(e.to_string()))
        }
        other => Err(Error::InvalidQuantity(format!("expected numeric metadata, got {other}"))),
    }
}
