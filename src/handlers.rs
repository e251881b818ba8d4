use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::config::Config;
use crate::engine::QuotaEngine;
use crate::error::Error;
use crate::exceptions::{
    ExceptionEffect, ExceptionScope, ExceptionStatus, LimitDimension, NewException,
};
use crate::maintenance::MaintenanceSweeps;
use crate::overage::OverageCalculator;
use crate::status::StatusReporter;
use crate::tiers::Tier;
use crate::usage::Period;

/// Shared application state
pub type SharedState = Arc<AppState>;

/// Application state containing the engine and its reporting facades
pub struct AppState {
    pub engine: QuotaEngine,
    pub reporter: StatusReporter,
    pub overage: OverageCalculator,
    pub sweeps: MaintenanceSweeps,
    pub config: Config,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CheckRequest {
    /// Weighted cost of this request; defaults to 1.
    #[validate(range(min = 0.0))]
    #[serde(default = "default_cost")]
    pub cost: f64,
}

fn default_cost() -> f64 {
    1.0
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateExceptionRequest {
    pub subject_id: Option<String>,
    pub dimension: LimitDimension,
    pub effect: ExceptionEffect,
    pub expires_at: Option<DateTime<Utc>>,
    #[validate(range(min = 1))]
    pub max_uses: Option<u32>,
    #[serde(default)]
    pub auto_expire: bool,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
    #[validate(length(min = 1, max = 100))]
    pub created_by: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RevokeRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSubscriptionRequest {
    pub tier: String,
    pub overage_allowed: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ListExceptionsQuery {
    pub subject_id: Option<String>,
    pub status: Option<String>,
    pub tier: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TopConsumersQuery {
    pub limit: Option<usize>,
    pub period: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SweepQuery {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub subjects: usize,
}

/// Check and record a request for a subject. Denials come back as 429 with
/// rate limit headers; allowed requests take a concurrent slot the caller
/// must release when done.
pub async fn check_request(
    State(state): State<SharedState>,
    Path(subject_id): Path<String>,
    Json(payload): Json<CheckRequest>,
) -> Result<impl IntoResponse, Error> {
    payload
        .validate()
        .map_err(|e| Error::Validation(e.to_string()))?;

    let decision = state.engine.check_and_record(&subject_id, payload.cost)?;

    let limit = decision.limits.hourly.to_string();
    let mut resp = Json(&decision).into_response();
    if let Ok(value) = limit.parse() {
        resp.headers_mut().insert("X-RateLimit-Limit", value);
    }

    if !decision.allowed {
        *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        if let Some(retry_after) = decision.retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                resp.headers_mut().insert("Retry-After", value);
            }
        }
    }

    Ok(resp)
}

/// Release a subject's concurrent slot after a request completes.
pub async fn release_slot(
    State(state): State<SharedState>,
    Path(subject_id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.engine.release_slot(&subject_id)?;
    Ok(Json(serde_json::json!({ "status": "released" })))
}

/// Current limits, usage, and reset times for a subject.
pub async fn subject_status(
    State(state): State<SharedState>,
    Path(subject_id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let report = state.reporter.status(&subject_id)?;
    Ok(Json(report))
}

/// Billable overage accrued in the subject's current hourly window.
pub async fn current_overage(
    State(state): State<SharedState>,
    Path(subject_id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let cost = state.overage.calculate_overage_cost(&subject_id)?;
    Ok(Json(serde_json::json!({
        "subject_id": subject_id,
        "overage_cost": cost,
    })))
}

pub async fn create_exception(
    State(state): State<SharedState>,
    Json(payload): Json<CreateExceptionRequest>,
) -> Result<impl IntoResponse, Error> {
    payload
        .validate()
        .map_err(|e| Error::Validation(e.to_string()))?;

    let scope = match payload.subject_id {
        Some(subject_id) => ExceptionScope::Subject(subject_id),
        None => ExceptionScope::Global,
    };
    let exception = state.engine.create_exception(NewException {
        scope,
        dimension: payload.dimension,
        effect: payload.effect,
        expires_at: payload.expires_at,
        max_uses: payload.max_uses,
        auto_expire: payload.auto_expire,
        reason: payload.reason,
        created_by: payload.created_by,
    })?;

    Ok((StatusCode::CREATED, Json(exception)))
}

pub async fn get_exception(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.engine.get_exception(id)?))
}

pub async fn list_exceptions(
    State(state): State<SharedState>,
    Query(query): Query<ListExceptionsQuery>,
) -> Result<impl IntoResponse, Error> {
    let status = query
        .status
        .as_deref()
        .map(parse_status)
        .transpose()?;
    let tier = query
        .tier
        .as_deref()
        .map(|s| {
            Tier::from_str(s).map_err(|_| Error::Validation(format!("unknown tier: {}", s)))
        })
        .transpose()?;
    let exceptions = state
        .engine
        .list_exceptions(query.subject_id.as_deref(), status, tier)?;
    Ok(Json(exceptions))
}

pub async fn revoke_exception(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RevokeRequest>,
) -> Result<impl IntoResponse, Error> {
    payload
        .validate()
        .map_err(|e| Error::Validation(e.to_string()))?;
    Ok(Json(state.engine.revoke_exception(id, &payload.reason)?))
}

pub async fn update_subscription(
    State(state): State<SharedState>,
    Path(subject_id): Path<String>,
    Json(payload): Json<UpdateSubscriptionRequest>,
) -> Result<impl IntoResponse, Error> {
    let tier = Tier::from_str(&payload.tier)
        .map_err(|_| Error::Validation(format!("unknown tier: {}", payload.tier)))?;
    let subscription =
        state
            .engine
            .update_subscription(&subject_id, tier, payload.overage_allowed)?;
    Ok(Json(subscription))
}

pub async fn top_consumers(
    State(state): State<SharedState>,
    Query(query): Query<TopConsumersQuery>,
) -> Result<impl IntoResponse, Error> {
    let period = match query.period.as_deref() {
        Some(s) => Period::from_str(s)
            .map_err(|_| Error::Validation(format!("unknown period: {}", s)))?,
        None => Period::Last24Hours,
    };
    let limit = query.limit.unwrap_or(10).min(100);
    Ok(Json(state.engine.top_consumers(limit, period)?))
}

pub async fn dashboard(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.engine.dashboard()?))
}

/// Trigger the usage retention sweep, optionally as a dry run.
pub async fn run_retention_sweep(
    State(state): State<SharedState>,
    Query(query): Query<SweepQuery>,
) -> Result<impl IntoResponse, Error> {
    let report = state
        .sweeps
        .run_retention(state.config.usage_retention_days, query.dry_run);
    Ok(Json(report))
}

/// Trigger the exception expiry sweep; `force` also expires auto-expire
/// exceptions that are not otherwise due.
pub async fn run_expiry_sweep(
    State(state): State<SharedState>,
    Query(query): Query<SweepQuery>,
) -> Result<impl IntoResponse, Error> {
    let report = state.sweeps.run_expiry(query.dry_run, query.force);
    Ok(Json(report))
}

pub async fn health_check(State(state): State<SharedState>) -> Result<impl IntoResponse, Error> {
    let stats = state.engine.dashboard()?;
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        subjects: stats.total_subjects,
    }))
}

fn parse_status(s: &str) -> Result<ExceptionStatus, Error> {
    match s {
        "active" => Ok(ExceptionStatus::Active),
        "expired" => Ok(ExceptionStatus::Expired),
        "revoked" => Ok(ExceptionStatus::Revoked),
        other => Err(Error::Validation(format!("unknown status: {}", other))),
    }
}
