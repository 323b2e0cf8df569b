use std::sync::Arc;

use crate::helpers;
use crate::types;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{http::StatusCode, Json, Router};
use bench_core::RawMeasurement;
use log::{error, info, warn};
use server::clock::Clock;
use server::config::ServerConfig;
use server::kv::KvStore;
use server::measurements::{record_timing, RecordOutcome};
use server::rollups::{list_rollups, RollupRow};
use server::scheduler::{ScheduleState, Scheduler};

/// Token-gated manual recompute; rate limited separately from the rest.
pub(crate) const RECOMPUTE_ROUTE: &str = "/api/init";

/// Shared handles every handler needs.
#[derive(Clone)]
pub(crate) struct AppState {
    pub store: Arc<dyn KvStore>,
    pub scheduler: Arc<Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<ServerConfig>,
}

/// Routes without the rate limiting and client IP layers, which `main`
/// adds on top.
pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/measurements", post(record_measurement))
        .route(RECOMPUTE_ROUTE, get(recompute_stats))
        .route("/schedule", get(get_schedule))
        .with_state(state)
}

/// Returns the rollup table, optionally narrowed to one region.
///
/// # Arguments
/// * `state` - Shared application state.
/// * `query` - Optional `region` filter.
///
/// # Returns
/// * `(StatusCode::OK, rows)` in key order.
/// * `(StatusCode::INTERNAL_SERVER_ERROR, empty)` when the store read fails.
pub(crate) async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<types::StatsQuery>,
) -> (StatusCode, Json<Vec<RollupRow>>) {
    let rows = match list_rollups(state.store.as_ref()).await {
        Ok(rows) => rows,
        Err(err) => {
            error!("Failed to list rollups: {}", err);
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(Vec::new()));
        }
    };

    let rows = match query.region.as_deref().map(str::trim) {
        Some(region) if !region.is_empty() => {
            rows.into_iter().filter(|row| row.region == region).collect()
        }
        _ => rows,
    };

    (StatusCode::OK, Json(rows))
}

/// Appends one measurement to the log.
///
/// The body is parsed by hand so any malformed payload maps to 400.
///
/// # Returns
/// * `(StatusCode::CREATED, key)` when recorded.
/// * `(StatusCode::BAD_REQUEST, error)` when the body is not a measurement.
/// * `(StatusCode::SERVICE_UNAVAILABLE, error)` when every candidate key collided.
/// * `(StatusCode::INTERNAL_SERVER_ERROR, error)` on store failures.
pub(crate) async fn record_measurement(
    State(state): State<AppState>,
    body: String,
) -> (StatusCode, Json<types::RecordMeasurementResponse>) {
    let measurement: RawMeasurement = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => {
            warn!("Rejected measurement payload: {}", err);
            return (
                StatusCode::BAD_REQUEST,
                Json(types::RecordMeasurementResponse {
                    error: Some(err.to_string()),
                    ..Default::default()
                }),
            );
        }
    };
    let measurement = helpers::stamp_region(measurement, &state.config.region_id);

    match record_timing(state.store.as_ref(), state.clock.as_ref(), &measurement).await {
        Ok(RecordOutcome::Recorded(key)) => (
            StatusCode::CREATED,
            Json(types::RecordMeasurementResponse {
                recorded: true,
                key: Some(key.to_string()),
                error: None,
            }),
        ),
        Ok(RecordOutcome::Dropped) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(types::RecordMeasurementResponse {
                error: Some("no free measurement key".to_string()),
                ..Default::default()
            }),
        ),
        Err(err) => {
            error!("Failed to record measurement: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(types::RecordMeasurementResponse {
                    error: Some("Internal server error".to_string()),
                    ..Default::default()
                }),
            )
        }
    }
}

/// Recomputes every rollup immediately. Requires `?token=` to match
/// `STATS_TOKEN`; the recurring schedule is left as it is.
///
/// # Returns
/// * `(StatusCode::OK, summary)` after the run.
/// * `(StatusCode::FORBIDDEN, default)` on a missing or wrong token.
/// * `(StatusCode::INTERNAL_SERVER_ERROR, default)` if the run fails.
pub(crate) async fn recompute_stats(
    State(state): State<AppState>,
    Query(query): Query<types::InitQuery>,
) -> (StatusCode, Json<types::RecomputeResponse>) {
    if !helpers::token_matches(query.token.as_deref(), state.config.stats_token.as_deref()) {
        warn!("Unauthorized recompute attempt");
        return (
            StatusCode::FORBIDDEN,
            Json(types::RecomputeResponse {
                message: "Request not authorized".to_string(),
                ..Default::default()
            }),
        );
    }

    match state.scheduler.aggregator().run().await {
        Ok(report) => {
            info!("Manual recompute finished ({} rollups)", report.rollups.len());
            (
                StatusCode::OK,
                Json(types::RecomputeResponse {
                    message: "Stats updated!".to_string(),
                    measurements: report.measurements,
                    rollups: report.rollups.len(),
                    elapsed_ms: u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
                }),
            )
        }
        Err(err) => {
            error!("Manual recompute failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(types::RecomputeResponse {
                    message: "Internal server error".to_string(),
                    ..Default::default()
                }),
            )
        }
    }
}

/// Schedule diagnostics: lock, next and last delivery, failure marker.
pub(crate) async fn get_schedule(State(state): State<AppState>) -> (StatusCode, Json<ScheduleState>) {
    match state.scheduler.schedule_state().await {
        Ok(schedule) => (StatusCode::OK, Json(schedule)),
        Err(err) => {
            error!("Failed to read schedule state: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ScheduleState::default()))
        }
    }
}
