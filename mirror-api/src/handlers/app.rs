use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use mirror_common::metrics;
use mirror_common::pipeline::AccountProcessor;
use mirror_common::transactions::TransactionResolver;
use tower_http::trace::TraceLayer;

use super::{admin, webhook};
use crate::integrity::IntegrityChecker;
use crate::refresh::FullRefresh;

#[derive(Clone)]
pub struct AppState {
    pub processor: AccountProcessor,
    pub resolver: Arc<TransactionResolver>,
    pub refresh: Arc<FullRefresh>,
    pub integrity: Arc<IntegrityChecker>,
    pub accounts_config_path: String,
    pub webhook_secret: String,
    pub admin_password: String,
}

pub fn app(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/_liveness", routing::get(index))
        .route("/_readiness", routing::get(readiness))
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .route("/account-webhook", routing::post(webhook::accounts))
        .route("/transaction-webhook", routing::post(webhook::transactions))
        .route("/refresh", routing::post(admin::refresh))
        .route("/integrity-check", routing::post(admin::integrity_check))
        .route("/reload", routing::post(admin::reload))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(metrics::track_metrics))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "account mirror api"
}

async fn readiness(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(state.processor.pool()).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
