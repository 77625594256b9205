use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

const REDACTED: &str = "***";

/// The configuration as JSON, with API keys masked.
///
/// An unset key stays an empty string so callers can still tell it apart
/// from a configured one.
pub fn redacted_config(config: &AppConfig) -> serde_json::Value {
    let mask = |key: &str| if key.is_empty() { "" } else { REDACTED };
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "transcription": {
            "api_key": mask(&config.transcription.api_key),
            "url": config.transcription.url,
            "model": config.transcription.model,
            "language": config.transcription.language,
            "endpointing_ms": config.transcription.endpointing_ms,
            "interim_results": config.transcription.interim_results,
            "vad_events": config.transcription.vad_events
        },
        "synthesis": {
            "api_key": mask(&config.synthesis.api_key),
            "url": config.synthesis.url,
            "model": config.synthesis.model,
            "encoding": config.synthesis.encoding,
            "sample_rate": config.synthesis.sample_rate,
            "max_chars": config.synthesis.max_chars,
            "max_sentences": config.synthesis.max_sentences
        },
        "reasoning": {
            "api_key": mask(&config.reasoning.api_key),
            "url": config.reasoning.url,
            "model": config.reasoning.model,
            "temperature": config.reasoning.temperature,
            "history_window": config.reasoning.history_window
        },
        "session": config.session,
        "performance": config.performance
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted_config(&config)
    })))
}

/// Apply a partial update. Running sessions keep their settings; only
/// sessions opened afterwards see the change.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted_config(&current_config)
    })))
}
