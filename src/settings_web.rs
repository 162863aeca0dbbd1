use crate::decision::{valid_unit, Policy};
use crate::errors::{VeilError, VeilResult};
use crate::persistence::{PersistenceBridge, RecordStats, KEY_AI_THRESHOLD, KEY_MISINFO_THRESHOLD};
use axum::{
    extract::Extension,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Threshold pair as the popup reads and writes it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsBody {
    pub ai_generated_threshold: f64,
    pub news_threshold: f64,
}

impl From<Policy> for SettingsBody {
    fn from(policy: Policy) -> Self {
        Self {
            ai_generated_threshold: policy.ai_threshold,
            news_threshold: policy.misinfo_threshold,
        }
    }
}

impl SettingsBody {
    fn into_policy(self) -> VeilResult<Policy> {
        if !valid_unit(self.ai_generated_threshold) {
            return Err(VeilError::validation(KEY_AI_THRESHOLD, "must be within 0..=1"));
        }
        if !valid_unit(self.news_threshold) {
            return Err(VeilError::validation(KEY_MISINFO_THRESHOLD, "must be within 0..=1"));
        }
        Ok(Policy::new(self.ai_generated_threshold, self.news_threshold))
    }
}

/// Settings surface over the shared store, plus health checks.
pub fn build_settings_router(bridge: Arc<PersistenceBridge>) -> Router {
    Router::new()
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/stats", get(stats))
        .route("/api/record/clear", post(clear_record))
        .route("/healthz", get(healthz))
        .layer(Extension(bridge))
        .layer(CorsLayer::permissive())
}

async fn get_settings(
    Extension(bridge): Extension<Arc<PersistenceBridge>>,
) -> VeilResult<Json<SettingsBody>> {
    Ok(Json(bridge.load_policy().await?.into()))
}

async fn update_settings(
    Extension(bridge): Extension<Arc<PersistenceBridge>>,
    Json(body): Json<SettingsBody>,
) -> VeilResult<Json<SettingsBody>> {
    let policy = body.into_policy()?;
    bridge.save_policy(&policy).await?;
    info!(
        ai_threshold = policy.ai_threshold,
        misinfo_threshold = policy.misinfo_threshold,
        "thresholds updated over http"
    );
    Ok(Json(policy.into()))
}

async fn stats(Extension(bridge): Extension<Arc<PersistenceBridge>>) -> VeilResult<Json<RecordStats>> {
    Ok(Json(bridge.stats().await?))
}

async fn clear_record(
    Extension(bridge): Extension<Arc<PersistenceBridge>>,
) -> VeilResult<Json<RecordStats>> {
    bridge.clear_record().await?;
    Ok(Json(bridge.stats().await?))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Bind and serve until the process is stopped.
pub async fn serve(bridge: Arc<PersistenceBridge>, host: &str, port: u16) -> VeilResult<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| VeilError::io(format!("binding {addr}"), e))?;
    info!(%addr, "settings api listening");
    axum::serve(listener, build_settings_router(bridge))
        .await
        .map_err(|e| VeilError::io("serving settings api", e))
}
