//! Route handlers.

use std::net::Ipv4Addr;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::error::ApiError;
use super::extract::SystemAuth;
use super::AppState;
use crate::handlers::InventorySubmission;
use crate::metrics::MetricsCollector;
use crate::scheduler::QueueStats;

/// Body of an acknowledged heartbeat.
#[derive(Debug, Serialize)]
pub struct HeartbeatAck {
    pub system_key: String,
    pub acknowledged: bool,
    pub last_heartbeat: DateTime<Utc>,
}

/// Body of an accepted inventory.
#[derive(Debug, Serialize)]
pub struct InventoryAccepted {
    pub system_id: String,
    pub timestamp: DateTime<Utc>,
    pub data_size: usize,
    pub queue_status: &'static str,
}

/// `POST /api/systems/heartbeat`
pub async fn heartbeat(
    State(state): State<AppState>,
    SystemAuth(system): SystemAuth,
) -> Result<Json<HeartbeatAck>, ApiError> {
    let beat = state
        .repository
        .upsert_heartbeat(&system.system_id, Utc::now())
        .await
        .inspect_err(|e| warn!(system_id = %system.system_id, error = %e, "Heartbeat not stored"))?;

    debug!(system_id = %system.system_id, "Heartbeat received");
    Ok(Json(HeartbeatAck {
        system_key: system.system_key,
        acknowledged: true,
        last_heartbeat: beat.last_heartbeat,
    }))
}

/// `POST /api/systems/inventory`
///
/// Validates the snapshot and hands it to the inventory queue. Storage and
/// change detection happen asynchronously.
pub async fn submit_inventory(
    State(state): State<AppState>,
    SystemAuth(system): SystemAuth,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<InventoryAccepted>), ApiError> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge {
                limit: state.config.max_request_size,
            }
        } else {
            ApiError::BadRequest(rejection.body_text())
        }
    })?;

    let data: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {}", e)))?;
    validate_inventory(&data).map_err(ApiError::BadRequest)?;

    let submission = InventorySubmission {
        timestamp: Utc::now(),
        data,
    };
    let enqueue = state
        .queue
        .enqueue_inventory(&system.system_id, &submission);
    match tokio::time::timeout(state.config.enqueue_timeout, enqueue).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            warn!(system_id = %system.system_id, error = %e, "Inventory not queued");
            return Err(e.into());
        }
        Err(_) => {
            warn!(system_id = %system.system_id, "Inventory enqueue timed out");
            return Err(ApiError::Unavailable("enqueue timed out".to_string()));
        }
    }

    MetricsCollector::new().record_inventory_received();
    info!(system_id = %system.system_id, data_size = body.len(), "Inventory queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(InventoryAccepted {
            system_id: system.system_id,
            timestamp: submission.timestamp,
            data_size: body.len(),
            queue_status: "queued",
        }),
    ))
}

/// `GET /api/health`
pub async fn health(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    let stats = state.queue.get_queue_stats().await?;
    Ok(Json(stats))
}

/// Aborts requests running longer than the configured deadline.
pub async fn request_deadline(
    State(limit): State<std::time::Duration>,
    request: Request,
    next: Next,
) -> Response {
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => ApiError::Timeout.into_response(),
    }
}

/// Checks the required fields of an inventory snapshot.
pub fn validate_inventory(data: &Value) -> Result<(), String> {
    let root = data
        .as_object()
        .ok_or_else(|| "inventory must be a JSON object".to_string())?;

    non_empty_str(root.get("fqdn"), "fqdn")?;
    let address = non_empty_str(root.get("ipv4_address"), "ipv4_address")?;
    address
        .parse::<Ipv4Addr>()
        .map_err(|_| format!("ipv4_address '{}' is not an IPv4 address", address))?;

    let os = root
        .get("os")
        .and_then(Value::as_object)
        .ok_or_else(|| "os is required and must be an object".to_string())?;
    for field in ["name", "type", "family"] {
        non_empty_str(os.get(field), &format!("os.{}", field))?;
    }
    match os.get("release") {
        None | Some(Value::Null) => return Err("os.release is required".to_string()),
        Some(Value::String(s)) if s.is_empty() => {
            return Err("os.release must not be empty".to_string())
        }
        Some(_) => {}
    }

    for optional in ["hardware", "network", "services", "features", "custom"] {
        if let Some(value) = root.get(optional) {
            if !(value.is_object() || value.is_array() || value.is_null()) {
                return Err(format!("{} must be an object or an array", optional));
            }
        }
    }
    Ok(())
}

fn non_empty_str<'a>(value: Option<&'a Value>, field: &str) -> Result<&'a str, String> {
    match value.and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(format!("{} is required", field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "fqdn": "node1.example.com",
            "ipv4_address": "10.0.0.5",
            "os": {"name": "Rocky Linux", "type": "linux", "family": "rhel", "release": "9.3"},
            "hardware": {"cpus": 4}
        })
    }

    #[test]
    fn test_accepts_complete_inventory() {
        assert!(validate_inventory(&valid()).is_ok());

        let mut structured_release = valid();
        structured_release["os"]["release"] = json!({"full": "9.3", "major": 9});
        assert!(validate_inventory(&structured_release).is_ok());
    }

    #[test]
    fn test_reports_first_missing_field() {
        let mut data = valid();
        data.as_object_mut().unwrap().remove("fqdn");
        assert_eq!(validate_inventory(&data).unwrap_err(), "fqdn is required");

        let mut data = valid();
        data["os"].as_object_mut().unwrap().remove("family");
        assert_eq!(validate_inventory(&data).unwrap_err(), "os.family is required");

        let mut data = valid();
        data["os"]["release"] = Value::Null;
        assert_eq!(validate_inventory(&data).unwrap_err(), "os.release is required");
    }

    #[test]
    fn test_rejects_bad_address_and_shapes() {
        let mut data = valid();
        data["ipv4_address"] = json!("10.0.0.256");
        assert!(validate_inventory(&data).unwrap_err().contains("not an IPv4"));

        let mut data = valid();
        data["services"] = json!("sshd");
        assert!(validate_inventory(&data).is_err());

        assert!(validate_inventory(&json!(["not", "an", "object"])).is_err());
    }
}
