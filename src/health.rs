//! # Health and Metrics Endpoints
//!
//! - `GET /health`, `GET /api/v1/health`: liveness plus a summary of voice
//!   session load and which collaborators have credentials
//! - `GET /api/v1/metrics`: per-route request metrics and voice counters

use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": metrics.active_sessions,
            "opened": metrics.voice.sessions_opened,
            "rejected": metrics.voice.sessions_rejected
        },
        "collaborators": collaborator_status(&config),
        "system": load_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "voice": {
            "active_sessions": metrics.active_sessions,
            "sessions_opened": metrics.voice.sessions_opened,
            "sessions_closed": metrics.voice.sessions_closed,
            "sessions_rejected": metrics.voice.sessions_rejected,
            "setup_failures": metrics.voice.setup_failures,
            "client_stops": metrics.voice.client_stops,
            "turns_started": metrics.voice.turns_started,
            "interruptions": metrics.voice.interruptions
        }
    }))
}

fn collaborator_status(config: &AppConfig) -> serde_json::Value {
    json!({
        "transcription": {
            "model": config.transcription.model,
            "configured": !config.transcription.api_key.is_empty()
        },
        "synthesis": {
            "model": config.synthesis.model,
            "configured": !config.synthesis.api_key.is_empty()
        },
        "reasoning": {
            "model": config.reasoning.model,
            "configured": !config.reasoning.api_key.is_empty()
        }
    })
}

fn load_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let max_sessions = config.performance.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        metrics.active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "full"
    } else if session_usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": metrics.active_sessions
    })
}
