//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every voice WebSocket actor.
//!
//! ## Contents:
//! - **config**: runtime configuration, replaceable through `PUT /api/v1/config`
//! - **metrics**: request counters and voice session counters
//! - **services**: the collaborator set every voice session is built with
//!
//! ## Arc<RwLock<T>> Pattern
//! Handlers read far more often than they write, so config and metrics sit
//! behind `std::sync::RwLock`. No lock here is ever held across an `.await`.
//! A poisoned lock still holds consistent counters, so it is recovered
//! instead of propagating the panic.

use crate::config::AppConfig;
use crate::services::Services;
use crate::voice::{SessionController, SessionEnd, SessionSettings, SessionSummary};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::info;

/// The application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and voice session metrics
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// External collaborators injected into each voice session
    pub services: Services,

    /// When the server started (for uptime calculation)
    pub start_time: Instant,
}

/// Application-wide performance metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AppMetrics {
    /// Total number of HTTP requests received since server start
    pub request_count: u64,

    /// Total number of requests that resulted in errors (4xx or 5xx)
    pub error_count: u64,

    /// Voice sessions currently holding a slot
    pub active_sessions: u32,

    /// Per-route metrics, keyed by "METHOD pattern"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    pub voice: VoiceMetrics,
}

/// Counters over finished and refused voice sessions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VoiceMetrics {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    /// Sessions whose transcription source could not be opened
    pub setup_failures: u64,
    /// Upgrades refused because every session slot was taken
    pub sessions_rejected: u64,
    /// Sessions ended by a `stop` record rather than a disconnect
    pub client_stops: u64,
    pub turns_started: u64,
    pub interruptions: u64,
}

/// Performance metrics for a specific route.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub error_count: u64,
    /// Total time spent processing requests to this route (in milliseconds)
    pub total_duration_ms: u64,
}

impl EndpointMetric {
    /// Average response time in milliseconds, 0.0 before the first request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.request_count as f64
    }

    /// Fraction of requests that failed, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.request_count as f64
    }
}

/// A held voice session slot. Dropping it frees the slot.
pub struct SessionPermit {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }
}

impl AppState {
    pub fn new(config: AppConfig, services: Services) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            services,
            start_time: Instant::now(),
        }
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Only sessions opened afterwards see the new values; a running session
    /// keeps the settings it started with.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    /// A session controller built from the current configuration.
    pub fn session_controller(&self) -> SessionController {
        SessionController::new(
            self.services.clone(),
            SessionSettings::from_config(&self.get_config()),
        )
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        metric.request_count += 1;
        metric.total_duration_ms += duration_ms;
        if is_error {
            metric.error_count += 1;
        }
    }

    /// Claim a voice session slot, or `None` when all `max_concurrent_sessions`
    /// are taken. The check and the increment happen under one write lock.
    pub fn try_acquire_session(&self) -> Option<SessionPermit> {
        let limit = self.get_config().performance.max_concurrent_sessions;
        let mut metrics = self.write_metrics();
        if metrics.active_sessions as usize >= limit {
            metrics.voice.sessions_rejected += 1;
            return None;
        }
        metrics.active_sessions += 1;
        metrics.voice.sessions_opened += 1;
        Some(SessionPermit {
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Fold a finished session into the voice counters.
    pub fn record_session(&self, summary: &SessionSummary) {
        info!(
            session_id = %summary.session_id,
            conversation_id = %summary.conversation_id,
            end = ?summary.end,
            turns = summary.turns,
            interruptions = summary.interruptions,
            duration_ms = summary.duration.as_millis() as u64,
            "voice session closed"
        );
        let mut metrics = self.write_metrics();
        let voice = &mut metrics.voice;
        voice.sessions_closed += 1;
        voice.turns_started += summary.turns;
        voice.interruptions += summary.interruptions;
        match summary.end {
            SessionEnd::SetupFailed => voice.setup_failures += 1,
            SessionEnd::ClientStop => voice.client_stops += 1,
            SessionEnd::Disconnected => {}
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
