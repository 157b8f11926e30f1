/**
 * API HTTP ATMOSYNC - Observation en lecture seule du kernel
 *
 * RÔLE :
 * Exposer l'état du registre, les derniers relevés, l'historique journalier
 * d'un capteur et l'état de l'ordonnanceur (watchers, compteurs de santé).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key
 * - Routes : /health, /system/health, /devices, /devices/latest,
 *   /devices/{name}/readings/{date}, /watchers
 * - Erreurs renvoyées en JSON { "error": "..." } avec le code HTTP adapté
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - Clé absente de l'environnement = accès refusé
 */

use crate::health::{HealthTracker, KernelHealth};
use crate::models::{Device, DeviceFilter, DeviceStatus, Reading};
use crate::scheduler::{WatcherInfo, WatcherMap};
use crate::store::{DeviceRegistry, JsonStore};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use time::macros::{format_description, time};
use time::{Date, OffsetDateTime, PrimitiveDateTime};
use tracing::{error, info, warn};

const VALID_OFFSETS: [i64; 3] = [1, 2, 5];

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(code: StatusCode, msg: &str) -> ApiError {
    (code, Json(json!({ "error": msg })))
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("ATMOSYNC_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        warn!("ATMOSYNC_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "rejected request without valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<JsonStore>,
    pub watchers: WatcherMap,
    pub health: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(list_devices))
        .route("/devices/latest", get(latest_readings))
        .route("/devices/{name}/readings/{date}", get(device_readings))
        .route("/watchers", get(list_watchers))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(&app.watchers))
}

// GET /watchers
async fn list_watchers(State(app): State<AppState>) -> Json<Vec<WatcherInfo>> {
    Json(app.watchers.snapshot())
}

// GET /devices
async fn list_devices(State(app): State<AppState>) -> Result<Json<Vec<Device>>, ApiError> {
    app.store.list_devices(&DeviceFilter::all()).await.map(Json).map_err(|e| {
        error!(error = %e, "device listing failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
    })
}

#[derive(Debug, Serialize, PartialEq)]
struct LatestView {
    id: usize,
    name: String,
    mac: Option<String>,
    ip: Option<String>,
    temperature: String,
    humidity: String,
    status: &'static str,
    #[serde(rename = "installTime")]
    install_time: String,
    #[serde(rename = "lastConnected")]
    last_connected: String,
    device_call_frequency: u64,
    device_location_id: Option<i64>,
}

/// "YYYY-MM-DD HH:MM" en UTC, "N/A" si absent
fn format_minute(at: Option<OffsetDateTime>) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]");
    at.and_then(|t| t.to_offset(time::UtcOffset::UTC).format(&fmt).ok())
        .unwrap_or_else(|| "N/A".to_string())
}

fn to_latest_view(position: usize, device: &Device, latest: Option<&Reading>) -> LatestView {
    LatestView {
        id: position + 1,
        name: device.name.clone(),
        mac: device.mac.clone(),
        ip: device.address.clone(),
        temperature: format!("{:.1}", latest.map_or(0.0, |r| r.temperature)),
        humidity: format!("{:.1}", latest.map_or(0.0, |r| r.humidity)),
        status: match device.status {
            DeviceStatus::Online => "active",
            DeviceStatus::Offline => "inactive",
        },
        install_time: format_minute(device.installed_at),
        last_connected: format_minute(device.last_connected),
        device_call_frequency: device.frequency_secs,
        device_location_id: device.location_id,
    }
}

// GET /devices/latest
async fn latest_readings(State(app): State<AppState>) -> Result<Json<Vec<LatestView>>, ApiError> {
    let devices = app.store.list_devices(&DeviceFilter::all()).await.map_err(|e| {
        error!(error = %e, "device listing failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
    })?;
    let latest = app.store.latest_readings().await;

    let views = devices
        .iter()
        .enumerate()
        .map(|(i, d)| to_latest_view(i, d, latest.get(&d.name)))
        .collect();
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
struct ReadingsParams {
    offset: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReadingsView {
    device: String,
    date: String,
    offset: i64,
    from: String,
    to: String,
    total_readings: usize,
    readings: Vec<Reading>,
}

fn parse_offset(raw: Option<&str>) -> Result<i64, ApiError> {
    let Some(raw) = raw else {
        return Ok(1);
    };
    match raw.trim().parse::<i64>() {
        Ok(n) if VALID_OFFSETS.contains(&n) => Ok(n),
        _ => Err(api_error(StatusCode::BAD_REQUEST, "Invalid offset value. Use 1, 2 or 5")),
    }
}

/// Bornes UTC d'une journée ; la fin est `now` si la date est celle du jour
fn day_bounds(date: Date, now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let start = PrimitiveDateTime::new(date, time!(00:00:00)).assume_utc();
    let end = if date == now.date() {
        now
    } else {
        PrimitiveDateTime::new(date, time!(23:59:59)).assume_utc()
    };
    (start, end)
}

/// Garde un relevé seulement s'il est à au moins `offset_minutes` du précédent gardé
fn downsample(readings: Vec<Reading>, offset_minutes: i64) -> Vec<Reading> {
    let gap = time::Duration::minutes(offset_minutes);
    let mut kept: Vec<Reading> = Vec::with_capacity(readings.len());
    for reading in readings {
        let far_enough = kept
            .last()
            .map_or(true, |last| reading.timestamp - last.timestamp >= gap);
        if far_enough {
            kept.push(reading);
        }
    }
    kept
}

fn format_second(at: OffsetDateTime) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    at.format(&fmt).unwrap_or_default()
}

// GET /devices/{name}/readings/{date}?offset=N
async fn device_readings(
    State(app): State<AppState>,
    Path((name, date)): Path<(String, String)>,
    Query(params): Query<ReadingsParams>,
) -> Result<Json<ReadingsView>, ApiError> {
    let offset = parse_offset(params.offset.as_deref())?;
    let day = Date::parse(&date, format_description!("[year]-[month]-[day]"))
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "Invalid date format. Use YYYY-MM-DD"))?;

    let (from, to) = day_bounds(day, OffsetDateTime::now_utc());
    let readings = app.store.readings_between(&name, from, to).await.map_err(|e| {
        error!(device = %name, error = %e, "readings query failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    })?;
    if readings.is_empty() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "No readings found for this device on the given date.",
        ));
    }

    let readings = downsample(readings, offset);
    info!(device = %name, date = %date, count = readings.len(), "readings returned");

    Ok(Json(ReadingsView {
        device: name,
        date,
        offset,
        from: format_second(from),
        to: format_second(to),
        total_readings: readings.len(),
        readings,
    }))
}
