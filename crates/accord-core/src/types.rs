//! Core domain types shared across the posting pipeline (spec §3, §4).

use crate::money::{Money, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub type EventId = Uuid;
pub type AccountId = Uuid;
pub type EntryId = Uuid;
pub type PolicyId = String;
pub type ActorId = String;

/// An inbound event as received from an external producer, prior to interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub event_type: String,
    pub idempotency_key: String,
    pub actor: ActorId,
    pub occurred_at: DateTime<Utc>,
    pub effective_date: DateTime<Utc>,
    pub payload: Value,
}

/// A general ledger account. Accounts are reference data, not posted-to directly;
/// lines reference accounts resolved by role (L1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,
    pub code: String,
    pub name: String,
    pub normal_side: Side,
    pub is_control_account: bool,
    pub subledger_type: Option<String>,
}

/// Fiscal period lifecycle state (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodStatus {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiscalPeriod {
    pub period_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: PeriodStatus,
    /// Whether an `Adjustment` posting is permitted for this period, independent
    /// of its current status (R13). A closed period with this set to `true`
    /// still accepts adjustments; an open period with it `false` does not.
    pub allows_adjustments: bool,
}

/// One side of a posted entry: a resolved account, amount, and direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLine {
    pub line_id: Uuid,
    pub account_id: AccountId,
    pub role: String,
    pub side: Side,
    pub money: Money,
    pub is_rounding_line: bool,
    pub metadata: BTreeMap<String, Value>,
}

/// A posted, immutable journal entry (R10). Once written, an entry's lines never
/// change; corrections are new entries linked via [`crate::link`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry_id: EntryId,
    pub ledger_id: String,
    pub sequence: i64,
    pub event_id: EventId,
    pub policy_id: PolicyId,
    pub effective_date: DateTime<Utc>,
    pub posted_at: DateTime<Utc>,
    pub lines: Vec<JournalLine>,
}

impl JournalEntry {
    /// Sum of debits minus sum of credits, per currency. A balanced entry has every
    /// currency's residual equal to zero (R4).
    pub fn residual_by_currency(&self) -> BTreeMap<String, rust_decimal::Decimal> {
        let mut totals: BTreeMap<String, rust_decimal::Decimal> = BTreeMap::new();
        for line in &self.lines {
            let signed = match line.side {
                Side::Debit => line.money.amount(),
                Side::Credit => -line.money.amount(),
            };
            *totals
                .entry(line.money.currency().code().to_string())
                .or_insert(rust_decimal::Decimal::ZERO) += signed;
        }
        totals
    }
}

/// Terminal outcome of interpreting one event, recorded exactly once per event
/// (P15).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InterpretationOutcome {
    Posted {
        entry_id: EntryId,
    },
    PendingApproval {
        request_id: Uuid,
    },
    Rejected {
        code: String,
        message: String,
    },
    Failed {
        code: String,
        message: String,
        retry_count: u32,
    },
    Abandoned {
        code: String,
        message: String,
        retry_count: u32,
    },
}

/// Typed relationship between two economic artifacts (invoices, shipments,
/// payments, corrections...) per spec §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    FulfilledBy,
    PaidBy,
    AppliedTo,
    ReversedBy,
    CorrectedBy,
    ConsumedBy,
    DerivedFrom,
    AllocatedTo,
    AllocatedFrom,
    MatchedWith,
    References,
}

impl LinkType {
    /// Directed link types participate in the acyclicity check (L3). `MatchedWith`
    /// is symmetric and `References` is a bare pointer, not a hierarchical edge;
    /// both are excluded.
    pub fn is_directed(self) -> bool {
        !matches!(self, LinkType::MatchedWith | LinkType::References)
    }

    /// At most one child may hold this link type against a given parent (L5's
    /// single-successor rule for reversal/correction chains).
    pub fn is_exclusive_child(self) -> bool {
        matches!(self, LinkType::ReversedBy | LinkType::CorrectedBy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicLink {
    pub link_id: Uuid,
    pub parent_ref: String,
    pub parent_type: String,
    pub child_ref: String,
    pub child_type: String,
    pub link_type: LinkType,
    pub creating_event_id: EventId,
    pub created_at: DateTime<Utc>,
}

/// A per-subledger posting mirrored alongside the GL control-account entry
/// (spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubledgerEntry {
    pub subledger_entry_id: Uuid,
    pub subledger_type: String,
    pub entry_id: EntryId,
    pub account_ref: String,
    pub side: Side,
    pub money: Money,
}

/// Costing method a [`CostLot`] was acquired under, matching the valuation
/// engine's strategy parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostMethod {
    Fifo,
    Lifo,
    WeightedAverage,
    Standard,
}

impl std::str::FromStr for CostMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(CostMethod::Fifo),
            "lifo" => Ok(CostMethod::Lifo),
            "weighted_average" => Ok(CostMethod::WeightedAverage),
            "standard" => Ok(CostMethod::Standard),
            other => Err(format!("unrecognized cost method '{other}'")),
        }
    }
}

/// A costing lot for inventory/valuation engines (FIFO/LIFO/weighted-average),
/// per spec §3's C1-C3 invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostLot {
    pub lot_id: Uuid,
    pub item_id: String,
    pub location_id: String,
    pub lot_date: DateTime<Utc>,
    pub original_quantity: rust_decimal::Decimal,
    pub original_cost: Money,
    pub currency: crate::money::Currency,
    pub cost_method: CostMethod,
    pub source_event_id: EventId,
}

impl CostLot {
    /// Constructs a lot, enforcing C1 (`original_quantity > 0`). `Money::new`
    /// already rejects a negative `original_cost` (C2), and `source_event_id` is
    /// a required, non-optional field of the type itself (C3).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lot_id: Uuid,
        item_id: impl Into<String>,
        location_id: impl Into<String>,
        lot_date: DateTime<Utc>,
        original_quantity: rust_decimal::Decimal,
        original_cost: Money,
        currency: crate::money::Currency,
        cost_method: CostMethod,
        source_event_id: EventId,
    ) -> Result<Self, crate::error::Error> {
        if original_quantity <= rust_decimal::Decimal::ZERO {
            return Err(crate::error::Error::InvalidQuantity(format!(
                "cost lot original_quantity must be positive, got {original_quantity}"
            )));
        }
        Ok(Self {
            lot_id,
            item_id: item_id.into(),
            location_id: location_id.into(),
            lot_date,
            original_quantity,
            original_cost,
            currency,
            cost_method,
            source_event_id,
        })
    }

    /// Unit cost derived from the lot's total acquisition cost and quantity.
    pub fn unit_cost(&self) -> rust_decimal::Decimal {
        self.original_cost.amount() / self.original_quantity
    }
}

/// Status of an approval request (spec §4.11, AL-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    /// Valid status transitions (AL-1); terminal states accept nothing further.
    pub fn transition_to(self, next: ApprovalStatus) -> Result<ApprovalStatus, crate::error::Error> {
        let allowed: &[ApprovalStatus] = match self {
            ApprovalStatus::Pending => &[
                ApprovalStatus::Approved,
                ApprovalStatus::Rejected,
                ApprovalStatus::Expired,
            ],
            ApprovalStatus::Approved | ApprovalStatus::Rejected | ApprovalStatus::Expired => &[],
        };
        if allowed.contains(&next) {
            Ok(next)
        } else {
            Err(crate::error::Error::InvalidTransition {
                expected: allowed.iter().map(status_name).collect(),
                actual: status_name(&next).to_string(),
            })
        }
    }
}

fn status_name(s: &ApprovalStatus) -> &'static str {
    match s {
        ApprovalStatus::Pending => "pending",
        ApprovalStatus::Approved => "approved",
        ApprovalStatus::Rejected => "rejected",
        ApprovalStatus::Expired => "expired",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: Uuid,
    pub event_id: EventId,
    pub entity_ref: String,
    pub policy_id: PolicyId,
    pub policy_hash: String,
    pub request_hash: String,
    /// The single currency the request's payload was coherent under at
    /// creation time (AL-3).
    pub currency: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decision_id: Uuid,
    pub request_id: Uuid,
    pub actor: ActorId,
    pub approved: bool,
    pub decided_at: DateTime<Utc>,
    pub reason: Option<String>,
}
