//! Standard pure calculation engines, registrable against
//! `accord_core::engine::EngineRegistry` under their canonical engine ids.

pub mod aging;
pub mod allocation;
pub mod approval_rule;
pub mod billing;
pub mod common;
pub mod correction;
pub mod ice;
pub mod matching;
pub mod reconciliation;
pub mod tax;
pub mod valuation;
pub mod variance;

use accord_core::engine::EngineRegistry;
use std::sync::Arc;

/// Builds a registry with every standard engine registered under its
/// canonical id. Callers may register additional, deployment-specific
/// engines alongside these.
pub fn standard_registry() -> EngineRegistry {
    let mut registry = EngineRegistry::new();
    registry.register("variance", Arc::new(variance::VarianceEngine));
    registry.register("allocation", Arc::new(allocation::AllocationEngine));
    registry.register("matching", Arc::new(matching::MatchingEngine));
    registry.register("aging", Arc::new(aging::AgingEngine));
    registry.register("tax", Arc::new(tax::TaxEngine));
    registry.register("valuation", Arc::new(valuation::ValuationEngine));
    registry.register("reconciliation", Arc::new(reconciliation::ReconciliationEngine));
    registry.register("correction", Arc::new(correction::CorrectionEngine));
    registry.register("billing", Arc::new(billing::BillingEngine));
    registry.register("ice", Arc::new(ice::IntercompanyEliminationEngine));
    registry.register("approval_rule", Arc::new(approval_rule::ApprovalRuleEngine));
    registry
}
