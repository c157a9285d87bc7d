use thiserror::Error;

/// Stable, machine-readable error codes surfaced to callers (R18).
///
/// Every coercion, rounding action, or rejection in the posting pipeline is explicit;
/// nothing is silently corrected (R19).
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid actor: {0}")]
    InvalidActor(String),

    #[error("actor frozen: {0}")]
    ActorFrozen(String),

    #[error("policy '{0}' was registered without a compilation receipt")]
    UncompiledPolicy(String),

    #[error("no admissible policy found for event type '{0}'")]
    ProfileNotFound(String),

    #[error("ambiguous dispatch for event type '{0}': {1} equally specific policies matched")]
    AmbiguousDispatch(String, usize),

    #[error("guard rejected posting: {reason_code}: {message}")]
    GuardRejected { reason_code: String, message: String },

    #[error("guard requires approval: {reason_code}: {message}")]
    GuardBlocked { reason_code: String, message: String },

    #[error("unbalanced entry for currency {currency}: residual {residual}")]
    Unbalanced { currency: String, residual: String },

    #[error("missing role binding for role '{0}'")]
    MissingRoleBinding(String),

    #[error("stale reference snapshot: expected {expected}, found {found}")]
    StaleSnapshot { expected: String, found: String },

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("negative amount: {0}")]
    NegativeAmount(String),

    #[error("unrecognized currency code: {0}")]
    UnrecognizedCurrency(String),

    #[error("currency incoherent across payload: {0:?}")]
    CurrencyIncoherent(Vec<String>),

    #[error("period '{0}' is closed")]
    PeriodClosed(String),

    #[error("period '{0}' is closing and only accepts close-step postings")]
    PeriodClosing(String),

    #[error("period '{0}' does not allow adjustment postings")]
    AdjustmentsNotAllowed(String),

    #[error("event already posted")]
    AlreadyPosted,

    #[error("idempotency conflict for key '{0}'")]
    IdempotencyConflict(String),

    #[error("subledger reconciliation failed for {subledger_type}/{currency}: residual {residual}")]
    SubledgerReconciliationFailed {
        subledger_type: String,
        currency: String,
        residual: String,
    },

    #[error("link would introduce a cycle for link_type {0}")]
    LinkCycle(String),

    #[error("self-links are not permitted (parent == child == '{0}')")]
    LinkSelf(String),

    #[error("invalid link type '{link_type}' between {parent_type} and {child_type}")]
    InvalidLinkType {
        link_type: String,
        parent_type: String,
        child_type: String,
    },

    #[error("engine '{0}' is not registered")]
    EngineNotRegistered(String),

    #[error("engine '{engine}' rejected parameters: {message}")]
    EngineParamInvalid { engine: String, message: String },

    #[error("engine '{engine}' failed: {message}")]
    EngineFailed { engine: String, message: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid status transition: expected one of {expected:?}, got '{actual}'")]
    InvalidTransition { expected: Vec<&'static str>, actual: String },

    #[error("max retries ({0}) exceeded")]
    MaxRetriesExceeded(u32),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The stable machine-readable code for this error, independent of message text.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            Error::InvalidActor(_) => "INVALID_ACTOR",
            Error::ActorFrozen(_) => "ACTOR_FROZEN",
            Error::UncompiledPolicy(_) => "UNCOMPILED_POLICY",
            Error::ProfileNotFound(_) => "PROFILE_NOT_FOUND",
            Error::AmbiguousDispatch(_, _) => "AMBIGUOUS_DISPATCH",
            Error::GuardRejected { .. } => "GUARD_REJECTED",
            Error::GuardBlocked { .. } => "GUARD_BLOCKED",
            Error::Unbalanced { .. } => "UNBALANCED",
            Error::MissingRoleBinding(_) => "MISSING_ROLE_BINDING",
            Error::StaleSnapshot { .. } => "STALE_SNAPSHOT",
            Error::InvalidQuantity(_) => "INVALID_QUANTITY",
            Error::NegativeAmount(_) => "NEGATIVE_AMOUNT",
            Error::UnrecognizedCurrency(_) => "UNRECOGNIZED_CURRENCY",
            Error::CurrencyIncoherent(_) => "CURRENCY_INCOHERENT",
            Error::PeriodClosed(_) => "PERIOD_CLOSED",
            Error::PeriodClosing(_) => "PERIOD_CLOSING",
            Error::AdjustmentsNotAllowed(_) => "ADJUSTMENTS_NOT_ALLOWED",
            Error::AlreadyPosted => "ALREADY_POSTED",
            Error::IdempotencyConflict(_) => "IDEMPOTENCY_CONFLICT",
            Error::SubledgerReconciliationFailed { .. } => "SUBLEDGER_RECONCILIATION_FAILED",
            Error::LinkCycle(_) => "LINK_CYCLE",
            Error::LinkSelf(_) => "LINK_SELF",
            Error::InvalidLinkType { .. } => "INVALID_LINK_TYPE",
            Error::EngineNotRegistered(_) => "ENGINE_NOT_REGISTERED",
            Error::EngineParamInvalid { .. } => "ENGINE_PARAM_INVALID",
            Error::EngineFailed { .. } => "ENGINE_FAILED",
            Error::InvariantViolation(_) => "INVARIANT_VIOLATION",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::MaxRetriesExceeded(_) => "MAX_RETRIES_EXCEEDED",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether this error is benign enough to not count as a pipeline failure
    /// (e.g. idempotent replays of an already-posted event).
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::AlreadyPosted)
    }
}
