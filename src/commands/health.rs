use crate::{error::AppError, state::AppState};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub streams: usize,
}

pub fn build_health_response(started_at: Instant, streams: usize) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        streams,
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    let streams = state.round_streams.lock().await.len();
    Ok(build_health_response(state.started_at, streams))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_reports_ok_status_and_stream_count() {
        let response = build_health_response(Instant::now(), 2);

        assert_eq!(response.status, "ok");
        assert_eq!(response.streams, 2);
        assert!(response.uptime_ms <= 1_000);
    }

    #[tokio::test]
    async fn health_counts_running_streams() {
        let state = AppState::default();
        let response = health(&state).await.expect("health should succeed");

        assert_eq!(response.streams, 0);
    }
}
