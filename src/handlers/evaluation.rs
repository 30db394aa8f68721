use crate::error::{AppError, AppResult};
use crate::evaluation::EvaluationClient;
use crate::session::transcript::TranscriptSegment;
use crate::session::SessionConfig;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

/// Body of `POST /api/v1/evaluate`.
#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub session: SessionConfig,
    #[serde(default)]
    pub transcript: Vec<TranscriptSegment>,
}

/// Generate a report for a transcript the caller already holds, for example to
/// retry after a `report_error` on the session socket.
pub async fn evaluate(
    state: web::Data<AppState>,
    body: web::Json<EvaluateRequest>,
) -> AppResult<HttpResponse> {
    let request = body.into_inner();
    request
        .session
        .validate()
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    let config = state.get_config();
    let client = EvaluationClient::new(&config.evaluation, config.live.api_key.clone());
    match client.evaluate(&request.session, &request.transcript).await {
        Ok(markdown) => {
            state.record_report(true);
            Ok(HttpResponse::Ok().json(json!({
                "markdown": markdown,
                "segments": request.transcript.len(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            })))
        }
        Err(e) => {
            warn!("Evaluation request failed: {}", e);
            state.record_report(false);
            Err(e.into())
        }
    }
}
