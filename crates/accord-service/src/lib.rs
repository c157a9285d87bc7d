#![deny(unsafe_code)]

use accord_core::approval::ApprovalService;
use accord_core::config::EngineConfig;
use accord_core::coordinator::Coordinator;
use accord_core::engine::{EngineDispatcher, EngineRegistry, EngineTrace};
use accord_core::journal::{AccountingIntent, JournalWriter};
use accord_core::link::{LinkAdmissibilityTable, LinkGraph};
use accord_core::period::{PeriodService, PostingKind};
use accord_core::policy::{CompiledPolicy, CompiledPolicyPack, RoleBindingMap};
use accord_core::sequence::SequenceService;
use accord_core::snapshot::ReferenceSnapshot;
use accord_core::storage::{LedgerStorageConfig, PersistentLedger};
use accord_core::subledger::SubledgerReconciler;
use accord_core::types::{
    ApprovalDecision, ApprovalRequest, ActorId, Event, EventId, InterpretationOutcome, JournalEntry, LinkType,
};
use accord_core::Error as CoreError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Configuration required to bring up a [`ServiceState`]: where the ledger
/// persists to, the compiled policy pack it posts against, and the ambient
/// engine/link/retry configuration (spec §6).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub ledger_storage: LedgerStorageConfig,
    pub engine_config: EngineConfig,
    /// Startup-loaded policies, compiled once into a [`CompiledPolicyPack`] at
    /// [`ServiceState::bootstrap`] time (spec §4.5's "compiled at load, not
    /// dispatched dynamically" resolution).
    pub policies: Vec<CompiledPolicy>,
    /// The reference snapshot's non-policy components; `policy_pack_fingerprint`
    /// is filled in from the compiled pack rather than taken from here (R6, R21).
    pub chart_of_accounts_hash: String,
    pub role_binding_map_hash: String,
    pub engine_registry_version: String,
    pub subledger_tolerance: Decimal,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ledger_storage: LedgerStorageConfig::Memory,
            engine_config: EngineConfig::default(),
            policies: Vec::new(),
            chart_of_accounts_hash: "genesis".into(),
            role_binding_map_hash: "genesis".into(),
            engine_registry_version: "1.0.0".into(),
            subledger_tolerance: Decimal::new(1, 2),
        }
    }
}

/// Shared, cloneable application state handed to every axum handler, mirroring
/// the teacher's `ServiceState` (engine handle + persistence, wrapped once at
/// boot and cheaply cloned per request).
#[derive(Clone)]
pub struct ServiceState {
    ledger: Arc<PersistentLedger>,
    sequences: Arc<SequenceService<Arc<PersistentLedger>>>,
    periods: Arc<PeriodService<Arc<PersistentLedger>>>,
    engines: Arc<EngineRegistry>,
    link_admissibility: Arc<LinkAdmissibilityTable>,
    engine_config: Arc<EngineConfig>,
    policies: Arc<CompiledPolicyPack>,
    snapshot: ReferenceSnapshot,
    subledger_tolerance: Decimal,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ledger = Arc::new(PersistentLedger::connect(config.ledger_storage).await?);
        let sequences = Arc::new(SequenceService::new(ledger.clone()));
        let periods = Arc::new(PeriodService::new(ledger.clone()));
        let link_admissibility = Arc::new(config.engine_config.link_admissibility_table());
        let policies = Arc::new(CompiledPolicyPack::load(config.policies)?);
        let snapshot = ReferenceSnapshot::new(
            config.chart_of_accounts_hash,
            config.role_binding_map_hash,
            policies.fingerprint.clone(),
            config.engine_registry_version,
        );

        Ok(Self {
            ledger,
            sequences,
            periods,
            engines: Arc::new(accord_engines::standard_registry()),
            link_admissibility,
            engine_config: Arc::new(config.engine_config),
            policies,
            snapshot,
            subledger_tolerance: config.subledger_tolerance,
        })
    }

    /// Builds the [`Coordinator`] for one request, borrowing this state's
    /// already-bootstrapped pack/registry/snapshot. Cheap: everything it
    /// borrows is an `Arc` or a small `Copy`/`Clone` value already held.
    fn coordinator(&self) -> Coordinator<'_, PersistentLedger> {
        Coordinator::new(self.ledger.as_ref(), &self.policies, &self.engines, self.snapshot.clone(), self.subledger_tolerance)
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/events", post(ingest_event))
        .route("/v1/periods/:period_id/close/begin", post(begin_close))
        .route("/v1/periods/:period_id/close/finalize", post(finalize_close))
        .route("/v1/journal/entries", post(post_journal_entry))
        .route("/v1/links", post(establish_link))
        .route("/v1/subledger/:subledger_type/reconcile", post(reconcile_subledger))
        .route("/v1/engines/dispatch", post(dispatch_engines))
        .route("/v1/approvals", post(create_approval_request))
        .route("/v1/approvals/:request_id/decisions", post(decide_approval))
        .route("/v1/audit/latest-hash", get(latest_audit_hash))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] CoreError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http { status: StatusCode::BAD_REQUEST, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Http { status, message } => (*status, "BAD_REQUEST", message.clone()),
            ApiError::Core(err) => (core_error_status(err), err.code(), err.to_string()),
        };
        (status, Json(serde_json::json!({ "error_code": code, "message": message }))).into_response()
    }
}

/// Maps a kernel [`CoreError`] to an HTTP status the way the teacher's
/// `ApiError::into_response` distinguishes client mistakes from server faults,
/// generalized to the kernel's richer error surface (R18).
fn core_error_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::ProtocolViolation(_)
        | CoreError::InvalidQuantity(_)
        | CoreError::NegativeAmount(_)
        | CoreError::Unbalanced { .. }
        | CoreError::MissingRoleBinding(_)
        | CoreError::InvalidLinkType { .. }
        | CoreError::LinkSelf(_)
        | CoreError::LinkCycle(_)
        | CoreError::EngineParamInvalid { .. }
        | CoreError::UncompiledPolicy(_) => StatusCode::BAD_REQUEST,
        CoreError::ProfileNotFound(_) | CoreError::EngineNotRegistered(_) => StatusCode::NOT_FOUND,
        CoreError::AlreadyPosted => StatusCode::CONFLICT,
        CoreError::PeriodClosed(_)
        | CoreError::PeriodClosing(_)
        | CoreError::AdjustmentsNotAllowed(_)
        | CoreError::IdempotencyConflict(_)
        | CoreError::StaleSnapshot { .. }
        | CoreError::AmbiguousDispatch(_, _)
        | CoreError::GuardRejected { .. }
        | CoreError::GuardBlocked { .. }
        | CoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", service: "accord-service" })
}

/// Posts one externally received event through the full pipeline (spec §6):
/// ingest -> select policy -> build meaning -> dispatch engines -> build the
/// intent -> resolve roles and write the journal -> record the outcome. Safe
/// to call twice with the same event; the coordinator's ingestor short-circuits
/// a replay to the previously recorded outcome (R3).
async fn ingest_event(
    State(state): State<ServiceState>,
    Json(request): Json<IngestEventRequest>,
) -> Result<Json<InterpretationOutcome>, ApiError> {
    let outcome = state.coordinator().post_event_from_external(request.event, request.actor).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct IngestEventRequest {
    event: Event,
    actor: ActorId,
}

#[derive(Debug, Deserialize)]
struct ClosePayload {
    #[serde(default)]
    kind: Option<String>,
}

async fn begin_close(
    Path(period_id): Path<Uuid>,
    State(state): State<ServiceState>,
) -> Result<Json<accord_core::types::FiscalPeriod>, ApiError> {
    Ok(Json(state.periods.begin_close(period_id).await?))
}

async fn finalize_close(
    Path(period_id): Path<Uuid>,
    State(state): State<ServiceState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.periods.finalize_close(period_id).await?;
    Ok(Json(serde_json::json!({ "period_id": period_id, "status": "closed" })))
}

#[derive(Debug, Deserialize)]
struct PostJournalRequest {
    intent: AccountingIntent,
    role_bindings: RoleBindingMap,
    intent_snapshot: ReferenceSnapshot,
    current_snapshot: ReferenceSnapshot,
    actor: String,
    #[serde(default)]
    posting_kind: Option<PostingKindDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PostingKindDto {
    Ordinary,
    CloseStep,
    Adjustment,
}

impl From<PostingKindDto> for PostingKind {
    fn from(value: PostingKindDto) -> Self {
        match value {
            PostingKindDto::Ordinary => PostingKind::Ordinary,
            PostingKindDto::CloseStep => PostingKind::CloseStep,
            PostingKindDto::Adjustment => PostingKind::Adjustment,
        }
    }
}

/// Gates and posts one journal entry, bypassing policy selection entirely (the
/// caller supplies an already-resolved [`AccountingIntent`] and role bindings
/// directly, e.g. a manual adjustment or a migration tool). Resolves the
/// entry's fiscal period, checks it against the posting kind (R12, R13, R25),
/// writes every ledger intent's entry atomically (L1, R4-R10, spec §4.7), and
/// records the terminal `Posted` outcome against the primary entry exactly
/// once (P15).
async fn post_journal_entry(
    State(state): State<ServiceState>,
    Json(request): Json<PostJournalRequest>,
) -> Result<Json<Vec<JournalEntry>>, ApiError> {
    let period = state.periods.find_period(request.intent.effective_date).await?;
    let kind = request.posting_kind.map(PostingKind::from).unwrap_or(PostingKind::Ordinary);
    state.periods.assert_open(&period, kind)?;

    let subledgers = SubledgerReconciler::new(state.ledger.as_ref());
    let writer = JournalWriter::new(state.ledger.as_ref(), &state.sequences, &subledgers);
    let entries = writer
        .post(
            &request.intent,
            &request.role_bindings,
            &request.intent_snapshot,
            &request.current_snapshot,
            &request.actor,
            chrono::Utc::now(),
        )
        .await?;

    let primary = entries
        .first()
        .ok_or_else(|| CoreError::InvariantViolation("journal write produced no entries".into()))?;

    let recorder = accord_core::coordinator::OutcomeRecorder::new(state.ledger.as_ref());
    recorder
        .record(primary.event_id, InterpretationOutcome::Posted { entry_id: primary.entry_id })
        .await?;

    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
struct EstablishLinkRequest {
    parent_ref: String,
    parent_type: String,
    child_ref: String,
    child_type: String,
    link_type: LinkType,
    creating_event_id: EventId,
}

async fn establish_link(
    State(state): State<ServiceState>,
    Json(request): Json<EstablishLinkRequest>,
) -> Result<Json<accord_core::types::EconomicLink>, ApiError> {
    let graph = LinkGraph::new(
        state.ledger.as_ref(),
        &state.link_admissibility,
        state.engine_config.max_link_traversal_depth,
    );
    let link = graph
        .establish_link(
            &request.parent_ref,
            &request.parent_type,
            &request.child_ref,
            &request.child_type,
            request.link_type,
            request.creating_event_id,
        )
        .await?;
    Ok(Json(link))
}

#[derive(Debug, Deserialize)]
struct ReconcileRequest {
    currency: String,
    tolerance: Decimal,
    #[serde(default)]
    close_time: bool,
}

async fn reconcile_subledger(
    Path(subledger_type): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ReconcileRequest>,
) -> Result<Json<accord_core::subledger::ReconciliationRecord>, ApiError> {
    let reconciler = SubledgerReconciler::new(state.ledger.as_ref());
    let record = if request.close_time {
        reconciler.check_close_time(&subledger_type, &request.currency, request.tolerance).await?
    } else {
        reconciler.check_post_time(&subledger_type, &request.currency, request.tolerance).await?
    };
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct DispatchEnginesRequest {
    engines: Vec<(String, serde_json::Value)>,
    payload: serde_json::Value,
}

async fn dispatch_engines(
    State(state): State<ServiceState>,
    Json(request): Json<DispatchEnginesRequest>,
) -> Result<Json<Vec<EngineTrace>>, ApiError> {
    if request.engines.is_empty() {
        return Err(ApiError::bad_request("engines must name at least one engine id"));
    }
    let dispatcher = EngineDispatcher::new(&state.engines);
    Ok(Json(dispatcher.dispatch_all(&request.engines, &request.payload)?))
}

#[derive(Debug, Deserialize)]
struct CreateApprovalRequest {
    event_id: EventId,
    entity_ref: String,
    policy_id: String,
    policy_hash: String,
    payload: serde_json::Value,
}

async fn create_approval_request(
    State(state): State<ServiceState>,
    Json(request): Json<CreateApprovalRequest>,
) -> Result<Json<ApprovalRequest>, ApiError> {
    let service = ApprovalService::new(state.ledger.as_ref());
    let request = service
        .create_request(
            request.event_id,
            &request.entity_ref,
            &request.policy_id,
            &request.policy_hash,
            &request.payload,
        )
        .await?;
    Ok(Json(request))
}

#[derive(Debug, Deserialize)]
struct DecideApprovalRequest {
    actor: String,
    approved: bool,
    current_policy_hash: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct DecideApprovalResponse {
    request: ApprovalRequest,
    decision: ApprovalDecision,
}

/// Records an approval decision. Policy-downgrade detection (AL-5) is a bare
/// hash inequality check here because this HTTP boundary has no independent
/// specificity signal to rank policy versions; a richer deployment would
/// inject a real predicate sourced from the compiled policy pack's version
/// history.
async fn decide_approval(
    Path(request_id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(request): Json<DecideApprovalRequest>,
) -> Result<Json<DecideApprovalResponse>, ApiError> {
    let service = ApprovalService::new(state.ledger.as_ref());
    let policy_is_downgrade = |previous_hash: &str, current_hash: &str| previous_hash != current_hash;
    let (request_out, decision) = service
        .record_decision(
            request_id,
            request.actor,
            request.approved,
            &request.current_policy_hash,
            policy_is_downgrade,
            request.reason,
        )
        .await?;
    Ok(Json(DecideApprovalResponse { request: request_out, decision }))
}

async fn latest_audit_hash(State(state): State<ServiceState>) -> Result<Json<serde_json::Value>, ApiError> {
    let hash = state.ledger.latest_audit_hash().await?;
    Ok(Json(serde_json::json!({ "latest_hash": hash })))
}
