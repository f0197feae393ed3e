//! Axum JSON API over the opportunity engine.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use radar_core::{Category, Chain, FilterSpec, OpportunityKind, RankKey, RiskLevel, Status};
use radar_engine::{OpportunityEngine, QueryError};
use serde::Deserialize;
use serde_json::json;

pub const CRATE_NAME: &str = "radar-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<OpportunityEngine>,
}

impl AppState {
    pub fn new(engine: Arc<OpportunityEngine>) -> Self {
        Self { engine }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/opportunities", get(opportunities_handler))
        .route("/opportunities/{id}", get(opportunity_detail_handler))
        .route("/opportunities/{id}/eligibility", post(eligibility_handler))
        .route("/opportunities/{id}/claim", post(claim_handler))
        .route("/categories/{category}", get(category_handler))
        .route("/diagnostics/latest", get(diagnostics_handler))
        .route("/scan", post(scan_handler))
        .with_state(state)
}

pub async fn serve_from_env(engine: Arc<OpportunityEngine>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("RADAR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

/// Comma-separated multi-value query parameters, parsed into a filter spec.
#[derive(Debug, Default, Deserialize)]
pub struct OpportunitiesQuery {
    pub chains: Option<String>,
    pub categories: Option<String>,
    pub kinds: Option<String>,
    pub statuses: Option<String>,
    pub min_confidence: Option<u8>,
    pub min_value: Option<f64>,
    pub max_risk: Option<String>,
    pub verified_only: Option<bool>,
    pub eligible_only: Option<bool>,
    pub rank: Option<String>,
}

fn parse_list<T>(
    raw: &Option<String>,
    field: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<Vec<T>>, String> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let mut values = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match parse(part) {
            Some(value) => values.push(value),
            None => return Err(format!("unknown {field} {part:?}")),
        }
    }
    Ok(if values.is_empty() { None } else { Some(values) })
}

pub fn filter_from_query(query: &OpportunitiesQuery) -> Result<(FilterSpec, RankKey), String> {
    let spec = FilterSpec {
        chains: parse_list(&query.chains, "chain", Chain::parse)?,
        categories: parse_list(&query.categories, "category", Category::parse)?,
        kinds: parse_list(&query.kinds, "kind", OpportunityKind::parse)?,
        statuses: parse_list(&query.statuses, "status", Status::parse)?,
        min_confidence: query.min_confidence,
        min_value: query.min_value,
        max_risk: match &query.max_risk {
            None => None,
            Some(raw) => Some(
                RiskLevel::parse(raw).ok_or_else(|| format!("unknown risk level {raw:?}"))?,
            ),
        },
        verified_only: query.verified_only.unwrap_or(false),
        eligible_only: query.eligible_only.unwrap_or(false),
    };
    let rank = match &query.rank {
        None => RankKey::default(),
        Some(raw) => RankKey::parse(raw).ok_or_else(|| format!("unknown rank key {raw:?}"))?,
    };
    Ok((spec, rank))
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn query_error(err: QueryError) -> Response {
    let status = match err {
        QueryError::NotFound(_) => StatusCode::NOT_FOUND,
        QueryError::NotConnected => StatusCode::BAD_REQUEST,
        QueryError::InvalidTransition(_) => StatusCode::CONFLICT,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

async fn index_handler(State(state): State<AppState>) -> Response {
    let latest = state.engine.latest_diagnostics().await;
    Json(json!({
        "service": "alpha-radar",
        "polling": state.engine.is_running(),
        "subscribers": state.engine.subscriber_count(),
        "last_cycle": latest.map(|d| d.cycle_id),
    }))
    .into_response()
}

async fn opportunities_handler(
    State(state): State<AppState>,
    Query(query): Query<OpportunitiesQuery>,
) -> Response {
    match filter_from_query(&query) {
        Err(message) => bad_request(message),
        Ok((spec, rank)) => {
            let items = state.engine.snapshot_filtered(&spec, rank).await;
            Json(items).into_response()
        }
    }
}

async fn opportunity_detail_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.engine.get_by_id(&id).await {
        Ok(opportunity) => Json(opportunity).into_response(),
        Err(err) => query_error(err),
    }
}

async fn category_handler(
    State(state): State<AppState>,
    AxumPath(category): AxumPath<String>,
) -> Response {
    match Category::parse(&category) {
        None => bad_request(format!("unknown category {category:?}")),
        Some(category) => Json(state.engine.get_by_category(category).await).into_response(),
    }
}

async fn diagnostics_handler(State(state): State<AppState>) -> Response {
    match state.engine.latest_diagnostics().await {
        Some(diagnostics) => Json(diagnostics).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no cycle has run yet" })),
        )
            .into_response(),
    }
}

async fn scan_handler(State(state): State<AppState>) -> Response {
    let diagnostics = state.engine.run_cycle().await;
    Json(diagnostics).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct EligibilityRequest {
    wallet: Option<String>,
}

async fn eligibility_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    body: Option<Json<EligibilityRequest>>,
) -> Response {
    let wallet = body.and_then(|Json(req)| req.wallet);
    match state.engine.check_eligibility(&id, wallet.as_deref()).await {
        Ok(check) => Json(check).into_response(),
        Err(err) => query_error(err),
    }
}

async fn claim_handler(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    match state.engine.record_claim(&id).await {
        Ok(opportunity) => Json(opportunity).into_response(),
        Err(err) => query_error(err),
    }
}
