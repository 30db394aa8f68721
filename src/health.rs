//! Health and metrics endpoints.

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
        "live": {
            "model": config.live.model,
            "voice": config.live.voice,
            "api_key_set": !config.live.api_key.is_empty()
        },
        "sessions": session_load(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": session_load(&config, &metrics),
        "counters": &metrics,
        "rates": {
            "turns_per_session": ratio(metrics.turns_committed, metrics.sessions_started),
            "dropped_chunk_rate": ratio(
                metrics.dropped_chunks,
                metrics.audio_chunks_played + metrics.dropped_chunks
            ),
            "report_failure_rate": ratio(
                metrics.report_failures,
                metrics.reports_generated + metrics.report_failures
            )
        }
    }))
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator > 0 {
        numerator as f64 / denominator as f64
    } else {
        0.0
    }
}

/// Slot usage against the configured limit.
fn session_load(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let max_sessions = config.performance.max_concurrent_sessions;
    let usage = if max_sessions > 0 {
        metrics.active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if usage >= 1.0 {
        "full"
    } else if usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "active": metrics.active_sessions,
        "max": max_sessions,
        "usage_percent": (usage * 100.0).round()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test as actix_test, App};

    #[actix_web::test]
    async fn test_health_reports_service_and_sessions() {
        let state = AppState::new(AppConfig::default());
        state.try_reserve_session();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"]["active"], 1);
        assert_eq!(body["live"]["api_key_set"], false);
    }

    #[actix_web::test]
    async fn test_metrics_exposes_counters() {
        let state = AppState::new(AppConfig::default());
        state.record_report(true);
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["counters"]["reports_generated"], 1);
        assert_eq!(body["rates"]["report_failure_rate"], 0.0);
    }

    #[test]
    fn test_session_load_status() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 2;
        let metrics = AppMetrics {
            active_sessions: 2,
            ..Default::default()
        };
        assert_eq!(session_load(&config, &metrics)["status"], "full");
    }
}
