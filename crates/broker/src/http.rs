use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use tributary_catalog::{CatalogRecord, CatalogStore, Page, QueryParams};
use tributary_contracts::{Action, BatchIssue, BrokerError, RecordSubmission, SessionMode};
use tributary_identity::IdentityScheme;
use tributary_policy::{FieldMask, PolicyCache, PolicyProvider, PolicyScope};
use tributary_query::{self as query, TranslateError};
use tributary_session::{AcceptAllValidator, SessionManager};

use crate::config::{BrokerConfig, StartupError};

#[derive(Clone)]
pub struct AppState {
    pub config: BrokerConfig,
    store: CatalogStore,
    sessions: SessionManager,
    policies: PolicyProvider,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: BrokerConfig) -> Result<Router, StartupError> {
    let store = CatalogStore::connect_and_migrate(
        &config.db_url,
        Duration::from_millis(config.write_timeout_ms),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: format!("failed to initialize catalog store: {}", err),
    })?;

    let identity = IdentityScheme::new(config.identity_secret.as_bytes());
    let sessions = SessionManager::new(store.clone(), identity, Arc::new(AcceptAllValidator));

    let policy_cache = PolicyCache::new(
        config.policy_cache_max_entries,
        Duration::from_millis(config.policy_cache_ttl_ms),
    );
    let policies = PolicyProvider::new(store.pool().clone(), policy_cache);

    let state = AppState {
        config,
        store,
        sessions,
        policies,
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/v1/connectors/{connector_id}/session", post(open_session))
        .route(
            "/v1/connectors/{connector_id}/session/{session_id}/records",
            post(submit_records),
        )
        .route(
            "/v1/connectors/{connector_id}/session/{session_id}/close",
            post(close_session),
        )
        .route("/v1/catalog/query", post(query_catalog))
        .route("/v1/catalog/types", get(catalog_types))
        .route("/v1/catalog/records/{public_id}", get(get_record))
        .with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OpenSessionRequest {
    mode: String,
}

#[derive(Debug, Serialize)]
struct OpenSessionResponse {
    session_id: String,
    mode: SessionMode,
}

async fn open_session(
    State(state): State<AppState>,
    Path(connector_id): Path<String>,
    headers: HeaderMap,
    req: Result<Json<OpenSessionRequest>, JsonRejection>,
) -> Result<Json<OpenSessionResponse>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let Json(req) = req.map_err(reject_body)?;
        let mode = SessionMode::parse(&req.mode).map_err(api_error)?;

        let session_id = state
            .sessions
            .open(&connector_id, mode)
            .await
            .map_err(api_error)?;

        crate::metrics::observe_session_opened(mode.as_str());
        tracing::info!(
            request_id = %request_id,
            connector_id = %connector_id,
            session_id = %session_id,
            mode = mode.as_str(),
            "broker.open_session"
        );

        Ok(Json(OpenSessionResponse { session_id, mode }))
    }
    .await;

    observe(
        "/v1/connectors/{connector_id}/session",
        "POST",
        &result,
        started,
    );
    result
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmitRecordsRequest {
    action: String,
    records: Vec<RecordSubmission>,
}

#[derive(Debug, Serialize)]
struct SubmitRecordsResponse {
    /// Vendor id to public id, for every record in the accepted batch.
    records: BTreeMap<String, String>,
}

async fn submit_records(
    State(state): State<AppState>,
    Path((connector_id, session_id)): Path<(String, String)>,
    headers: HeaderMap,
    req: Result<Json<SubmitRecordsRequest>, JsonRejection>,
) -> Result<Json<SubmitRecordsResponse>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let Json(req) = req.map_err(reject_body)?;
        let action = Action::parse(&req.action).map_err(api_error)?;

        let records = state
            .sessions
            .action(&connector_id, &session_id, action, &req.records)
            .await
            .map_err(api_error)?;

        crate::metrics::observe_record_batch(action.as_str());
        tracing::info!(
            request_id = %request_id,
            connector_id = %connector_id,
            session_id = %session_id,
            action = action.as_str(),
            records = records.len(),
            "broker.submit_records"
        );

        Ok(Json(SubmitRecordsResponse { records }))
    }
    .await;

    observe(
        "/v1/connectors/{connector_id}/session/{session_id}/records",
        "POST",
        &result,
        started,
    );
    result
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CloseSessionRequest {
    commit: bool,
}

#[derive(Debug, Serialize)]
struct CloseSessionResponse {
    committed: bool,
    replayed: u64,
}

async fn close_session(
    State(state): State<AppState>,
    Path((connector_id, session_id)): Path<(String, String)>,
    headers: HeaderMap,
    req: Result<Json<CloseSessionRequest>, JsonRejection>,
) -> Result<Json<CloseSessionResponse>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let Json(req) = req.map_err(reject_body)?;

        let replayed = state
            .sessions
            .close(&connector_id, &session_id, req.commit)
            .await
            .map_err(api_error)?;

        crate::metrics::observe_records_replayed(replayed);
        tracing::info!(
            request_id = %request_id,
            connector_id = %connector_id,
            session_id = %session_id,
            commit = req.commit,
            replayed,
            "broker.close_session"
        );

        Ok(Json(CloseSessionResponse {
            committed: req.commit,
            replayed,
        }))
    }
    .await;

    observe(
        "/v1/connectors/{connector_id}/session/{session_id}/close",
        "POST",
        &result,
        started,
    );
    result
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryRequest {
    #[serde(default)]
    filter: Option<serde_json::Value>,
    #[serde(default)]
    policy_id: Option<String>,
    #[serde(default)]
    connector_context: Vec<String>,
    #[serde(default, rename = "type")]
    entity_type: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    records: Vec<CatalogRecord>,
    count: usize,
}

async fn query_catalog(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let Json(req) = req.map_err(reject_body)?;

        let scope = resolve_scope(&state, req.policy_id.as_deref()).await?;
        let predicate = build_predicate(req.filter.as_ref(), &scope)?;
        let context = merge_context(&scope.connector_override, &req.connector_context);
        let mask = FieldMask::new(&scope.field_masks);

        let mut records = state
            .store
            .query(QueryParams {
                segment_sql: &predicate,
                connector_context: &context,
                type_filter: req.entity_type.as_deref(),
                id_filter: req.id.as_deref(),
                page: Page::clamped(req.limit, req.offset),
            })
            .await
            .map_err(api_error)?;

        if !mask.is_empty() {
            for record in &mut records {
                mask.apply(&mut record.document);
            }
        }

        crate::metrics::inc_catalog_query();
        tracing::info!(
            request_id = %request_id,
            policy_id = req.policy_id.as_deref().unwrap_or("-"),
            results = records.len(),
            "broker.query_catalog"
        );

        let count = records.len();
        Ok(Json(QueryResponse { records, count }))
    }
    .await;

    observe("/v1/catalog/query", "POST", &result, started);
    result
}

#[derive(Debug, Deserialize)]
struct ReadScopeParams {
    #[serde(default)]
    policy_id: Option<String>,
    /// Comma-separated connector ids granting visibility into non-live
    /// connectors.
    #[serde(default)]
    connector_context: Option<String>,
}

impl ReadScopeParams {
    fn context_list(&self) -> Vec<String> {
        self.connector_context
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct TypesResponse {
    types: Vec<String>,
}

async fn catalog_types(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ReadScopeParams>,
) -> Result<Json<TypesResponse>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let scope = resolve_scope(&state, params.policy_id.as_deref()).await?;
        let predicate = build_predicate(None, &scope)?;
        let context = merge_context(&scope.connector_override, &params.context_list());

        let types = state
            .store
            .types(&predicate, &context)
            .await
            .map_err(api_error)?;

        tracing::info!(
            request_id = %request_id,
            types = types.len(),
            "broker.catalog_types"
        );

        Ok(Json(TypesResponse { types }))
    }
    .await;

    observe("/v1/catalog/types", "GET", &result, started);
    result
}

async fn get_record(
    State(state): State<AppState>,
    Path(public_id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<ReadScopeParams>,
) -> Result<Json<CatalogRecord>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let scope = resolve_scope(&state, params.policy_id.as_deref()).await?;
        let predicate = build_predicate(None, &scope)?;
        let context = merge_context(&scope.connector_override, &params.context_list());
        let mask = FieldMask::new(&scope.field_masks);

        let mut record = state
            .store
            .find(&predicate, &context, &public_id)
            .await
            .map_err(api_error)?
            .ok_or_else(|| api_error(BrokerError::not_found("record", public_id.clone())))?;

        if !mask.is_empty() {
            mask.apply(&mut record.document);
        }

        tracing::info!(
            request_id = %request_id,
            public_id = %record.public_id,
            "broker.get_record"
        );

        Ok(Json(record))
    }
    .await;

    observe("/v1/catalog/records/{public_id}", "GET", &result, started);
    result
}

async fn resolve_scope(
    state: &AppState,
    policy_id: Option<&str>,
) -> Result<PolicyScope, ApiError> {
    let Some(policy_id) = policy_id.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(PolicyScope::default());
    };

    state
        .policies
        .resolve(policy_id)
        .await
        .map_err(api_error)?
        .ok_or_else(|| api_error(BrokerError::not_found("policy", policy_id)))
}

/// Compiles the client filter AND the policy segment into one predicate. A
/// client filter that fails translation is the caller's fault; a policy
/// segment that fails is a server-side misconfiguration.
fn build_predicate(
    filter: Option<&serde_json::Value>,
    scope: &PolicyScope,
) -> Result<String, ApiError> {
    let client = match filter {
        None => query::ALWAYS_TRUE.to_string(),
        Some(value) => {
            let translation = query::translate_value(value);
            if !translation.valid {
                crate::metrics::inc_rejected_filter();
                return Err(filter_rejection(translation.error));
            }
            translation.sql
        }
    };

    let segment = match scope.segment_query.as_ref() {
        None => query::ALWAYS_TRUE.to_string(),
        Some(value) => {
            let translation = query::translate_value(value);
            if !translation.valid {
                tracing::error!(
                    error = ?translation.error,
                    "policy segment query failed translation"
                );
                return Err(api_error(BrokerError::internal(
                    "policy segment query is not translatable",
                )));
            }
            translation.sql
        }
    };

    Ok(query::conjoin(&client, &segment))
}

fn filter_rejection(error: Option<TranslateError>) -> ApiError {
    let err = match error {
        Some(TranslateError::InvalidJson(detail)) => {
            BrokerError::bad_request(format!("filter is not valid JSON: {}", detail))
        }
        Some(TranslateError::UnknownOperator(op)) => {
            BrokerError::bad_request(format!("filter uses an unsupported operator: {}", op))
        }
        Some(TranslateError::Shape(detail)) => {
            BrokerError::bad_request(format!("filter has an invalid shape: {}", detail))
        }
        None => BrokerError::bad_request("filter rejected"),
    };
    api_error(err)
}

/// Policy override ids come first, then the caller's context, first
/// occurrence wins. The store truncates past its cap.
fn merge_context(policy_override: &[String], caller_context: &[String]) -> Vec<String> {
    let mut merged = Vec::with_capacity(policy_override.len() + caller_context.len());
    for id in policy_override.iter().chain(caller_context.iter()) {
        if !merged.contains(id) {
            merged.push(id.clone());
        }
    }
    merged
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-tributary-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && v.len() <= 64)
        .map(|v| v.to_string())
        .unwrap_or_else(|| Ulid::new().to_string())
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    issues: Vec<BatchIssue>,
}

fn api_error(err: BrokerError) -> ApiError {
    let status = match err.code() {
        "ERR_NOT_FOUND" => StatusCode::NOT_FOUND,
        "ERR_UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
        "ERR_BAD_REQUEST" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            code: err.code(),
            message: err.to_string(),
            issues: err.issues().to_vec(),
        }),
    )
}

fn reject_body(_: JsonRejection) -> ApiError {
    api_error(BrokerError::bad_request("invalid JSON body"))
}

fn observe<T>(route: &str, method: &str, result: &Result<T, ApiError>, started: Instant) {
    let status = match result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(route, method, status.as_u16(), started.elapsed());
}
