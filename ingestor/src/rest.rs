use crate::db::Storage;
use crate::model::GlobalAlarmConfig;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

struct AppState<S> {
    storage: Arc<S>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedResponse {
    message: String,
    mac_address: String,
}

pub fn create_router<S: Storage>(storage: Arc<S>) -> Router {
    let state = AppState { storage };

    Router::new()
        .route("/api/alarms/:mac", get(get_alarms::<S>).post(post_alarms::<S>))
        .with_state(state)
}

async fn get_alarms<S: Storage>(
    State(state): State<AppState<S>>,
    Path(mac): Path<String>,
) -> Result<Json<GlobalAlarmConfig>, AppError> {
    let mac = mac.trim();
    if mac.is_empty() {
        return Err(AppError::BadRequest("Sensor MAC address is required"));
    }

    info!("Fetching alarm configuration for sensor {}", mac);
    match state.storage.get_alarm_config(mac).await {
        Ok(Some(config)) => Ok(Json(config)),
        Ok(None) => Err(AppError::NotFound(format!(
            "No alarm configuration found for sensor {}",
            mac
        ))),
        Err(e) => Err(AppError::Internal(e.into())),
    }
}

async fn post_alarms<S: Storage>(
    State(state): State<AppState<S>>,
    Path(mac): Path<String>,
    body: Result<Json<GlobalAlarmConfig>, JsonRejection>,
) -> Result<Json<SavedResponse>, AppError> {
    let mac = mac.trim();
    if mac.is_empty() {
        return Err(AppError::BadRequest("Sensor MAC address is required"));
    }
    let Json(config) = body.map_err(|e| {
        warn!("Rejected alarm configuration for {}: {}", mac, e);
        AppError::BadRequest("A valid alarm configuration body is required")
    })?;

    info!("Saving alarm configuration for sensor {}", mac);
    state
        .storage
        .save_alarm_config(mac, &config)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok(Json(SavedResponse {
        message: "Alarm configuration saved".to_string(),
        mac_address: mac.to_string(),
    }))
}

enum AppError {
    BadRequest(&'static str),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Internal(e) => {
                // storage details stay in the log
                error!("API error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to process alarm configuration",
                )
                    .into_response()
            }
        }
    }
}
