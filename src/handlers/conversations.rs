//! Conversation history, read straight from the memory store.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// `GET /api/v1/conversations/{id}/messages?limit=N`, oldest first.
pub async fn get_messages(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = path.into_inner();
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(AppError::ValidationError(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }

    let messages = state.services.memory.recent(&conversation_id, limit).await?;

    Ok(HttpResponse::Ok().json(json!({
        "conversation_id": conversation_id,
        "count": messages.len(),
        "messages": messages
    })))
}

/// `DELETE /api/v1/conversations/{id}`
pub async fn delete_conversation(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = path.into_inner();
    let removed = state.services.memory.clear(&conversation_id).await?;
    if removed == 0 {
        return Err(AppError::NotFound(format!("Conversation {conversation_id} not found")));
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "deleted",
        "conversation_id": conversation_id,
        "removed_messages": removed
    })))
}
