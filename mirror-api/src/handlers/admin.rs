use axum::extract::{Query, State};
use axum::Json;
use mirror_common::auth::secret_matches;
use mirror_common::config::ConfigDocument;
use mirror_common::schema::SchemaRegistry;
use serde_derive::{Deserialize, Serialize};
use tracing::info;

use super::app::AppState;
use crate::error::ApiError;
use crate::refresh::TriggerStatus;

#[derive(Debug, Deserialize)]
pub struct AdminQuery {
    password: Option<String>,
    program: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    status: TriggerStatus,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    status: &'static str,
    programs: usize,
}

fn authorize(state: &AppState, query: &AdminQuery) -> Result<(), ApiError> {
    if secret_matches(&state.admin_password, query.password.as_deref()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// The requested program, or every tracked one when none is named.
fn target_programs(state: &AppState, program: Option<&str>) -> Result<Vec<String>, ApiError> {
    let registry = state.processor.registry().current();
    match program {
        Some(program) if registry.is_tracked(program) => Ok(vec![program.to_owned()]),
        Some(program) => Err(ApiError::UnknownProgram(program.to_owned())),
        None => Ok(registry.programs().map(str::to_owned).collect()),
    }
}

pub async fn refresh(
    State(state): State<AppState>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<TriggerResponse>, ApiError> {
    authorize(&state, &query)?;
    let programs = target_programs(&state, query.program.as_deref())?;

    let status = state.refresh.trigger(programs);
    info!(program = ?query.program, ?status, "refresh requested");
    Ok(Json(TriggerResponse { status }))
}

pub async fn integrity_check(
    State(state): State<AppState>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<TriggerResponse>, ApiError> {
    authorize(&state, &query)?;
    let programs = target_programs(&state, query.program.as_deref())?;

    let status = state.integrity.trigger(programs);
    info!(program = ?query.program, ?status, "integrity check requested");
    Ok(Json(TriggerResponse { status }))
}

/// Builds a fresh registry from the configuration document and swaps it in.
/// Nothing changes if loading or migrating fails.
pub async fn reload(
    State(state): State<AppState>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<ReloadResponse>, ApiError> {
    authorize(&state, &query)?;

    let document = ConfigDocument::load(&state.accounts_config_path)?;
    let registry = SchemaRegistry::load(&document)?;
    registry.migrate(state.processor.pool()).await?;

    let programs = registry.programs().count();
    state.processor.registry().replace(registry);
    info!(programs, "configuration reloaded");

    Ok(Json(ReloadResponse {
        status: "ok",
        programs,
    }))
}
