//! # Application State Management
//!
//! Shared state that every HTTP handler and every session socket can reach: the
//! runtime configuration, the session metrics, and the server start time.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: many owners of the same data across threads
//! - **Why needed**: actix runs one worker per core, and each worker builds its own
//!   `App`; all of them must see the same counters
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: many readers OR one writer at a time
//! - **Why needed**: config is read on every session start but rarely written
//!
//! ### Lock Poisoning
//! A lock is "poisoned" when a thread panicked while holding it. The data behind these
//! locks is plain counters and config, always left consistent between statements, so a
//! poisoned lock is recovered with `into_inner()` instead of propagating the panic.

use crate::config::AppConfig;
use crate::session::SessionObserver;
use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across all handlers and sockets.
///
/// ## Thread Safety Pattern:
/// Mutable data sits behind `Arc<RwLock<T>>`; `start_time` never changes so it is
/// stored directly. Cloning an `AppState` clones the `Arc`s, not the data.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Session counters, updated by every live session
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all sessions since server start.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Sockets currently holding a live-session slot
    pub active_sessions: usize,
    /// Sessions that completed the start sequence
    pub sessions_started: u64,
    /// Sessions refused because every slot was taken
    pub sessions_rejected: u64,
    /// Turns appended to a transcript (duplicates not counted)
    pub turns_committed: u64,
    /// Agent audio chunks scheduled for playback
    pub audio_chunks_played: u64,
    /// Agent audio chunks dropped because they failed to decode
    pub dropped_chunks: u64,
    /// Live connections that ended with an error or an unexpected close
    pub connection_errors: u64,
    /// Evaluation reports delivered
    pub reports_generated: u64,
    /// Evaluation requests that failed
    pub report_failures: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the read lock immediately, so a session start never blocks a
    /// config update for longer than the copy takes.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config;
        Ok(())
    }

    /// Claim a live-session slot.
    ///
    /// Check and increment happen under one write lock, so two sockets racing for the
    /// last slot cannot both get it. Returns false (and counts a rejection) when full.
    pub fn try_reserve_session(&self) -> bool {
        let limit = self.get_config().performance.max_concurrent_sessions;
        let mut metrics = self.write_metrics();
        if metrics.active_sessions >= limit {
            metrics.sessions_rejected += 1;
            return false;
        }
        metrics.active_sessions += 1;
        true
    }

    /// Give a slot back. Never goes below zero.
    pub fn release_session(&self) {
        let mut metrics = self.write_metrics();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }

    pub fn record_report(&self, success: bool) {
        let mut metrics = self.write_metrics();
        if success {
            metrics.reports_generated += 1;
        } else {
            metrics.report_failures += 1;
        }
    }

    /// Snapshot of current metrics, taken under a read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Sessions report into the shared counters.
impl SessionObserver for AppState {
    fn session_started(&self, _epoch: u64) {
        self.write_metrics().sessions_started += 1;
    }

    fn turn_committed(&self) {
        self.write_metrics().turns_committed += 1;
    }

    fn chunk_scheduled(&self) {
        self.write_metrics().audio_chunks_played += 1;
    }

    fn chunk_dropped(&self) {
        self.write_metrics().dropped_chunks += 1;
    }

    fn connection_lost(&self) {
        self.write_metrics().connection_errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_limit(limit: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = limit;
        AppState::new(config)
    }

    #[test]
    fn test_session_slots_are_limited() {
        let state = state_with_limit(2);
        assert!(state.try_reserve_session());
        assert!(state.try_reserve_session());
        assert!(!state.try_reserve_session());

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_sessions, 2);
        assert_eq!(metrics.sessions_rejected, 1);

        state.release_session();
        assert!(state.try_reserve_session());
    }

    #[test]
    fn test_release_never_underflows() {
        let state = state_with_limit(1);
        state.release_session();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_observer_updates_counters() {
        let state = state_with_limit(1);
        state.session_started(1);
        state.turn_committed();
        state.chunk_scheduled();
        state.chunk_scheduled();
        state.chunk_dropped();
        state.connection_lost();
        state.record_report(true);
        state.record_report(false);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.sessions_started, 1);
        assert_eq!(metrics.turns_committed, 1);
        assert_eq!(metrics.audio_chunks_played, 2);
        assert_eq!(metrics.dropped_chunks, 1);
        assert_eq!(metrics.connection_errors, 1);
        assert_eq!(metrics.reports_generated, 1);
        assert_eq!(metrics.report_failures, 1);
    }

    #[test]
    fn test_update_config_validates() {
        let state = state_with_limit(1);
        let mut bad = state.get_config();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());

        let mut good = state.get_config();
        good.live.voice = "Puck".to_string();
        assert!(state.update_config(good).is_ok());
        assert_eq!(state.get_config().live.voice, "Puck");
    }
}
