//! Probes: `/health` (report), `/health/live` and `/health/ready`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::AppState;

fn report(state: &AppState) -> Value {
    json!({
        "cse_id": &*state.cse_id,
        "state": state.shutdown.health_state().as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    })
}

/// Always 200 while the process serves HTTP; the body carries the state.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(report(&state))
}

pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// 200 while the binding accepts oneM2M requests, 503 otherwise.
pub async fn readiness_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let status = if state.shutdown.health_state().accepts_requests() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report(&state)))
}

#[cfg(test)]
mod tests {
    use cse_core::ResponseStatusCode;

    use super::*;
    use crate::network::handlers::test_support::recording_state;

    #[tokio::test]
    async fn report_names_the_node_and_counts_requests() {
        let (state, _) = recording_state(ResponseStatusCode::Ok);
        state.shutdown.set_ready();
        let _running = state.shutdown.in_flight_guard();

        let Json(body) = health_handler(State(state)).await;
        assert_eq!(body["cse_id"], "mn-cse-1");
        assert_eq!(body["state"], "ready");
        assert_eq!(body["in_flight"], 1);
    }

    #[tokio::test]
    async fn readiness_tracks_the_binding_lifecycle() {
        let (state, _) = recording_state(ResponseStatusCode::Ok);
        let phases = [
            (None, StatusCode::SERVICE_UNAVAILABLE, "starting"),
            (Some(true), StatusCode::OK, "ready"),
            (Some(false), StatusCode::SERVICE_UNAVAILABLE, "draining"),
        ];
        for (ready, expected, name) in phases {
            match ready {
                Some(true) => state.shutdown.set_ready(),
                Some(false) => state.shutdown.trigger_shutdown(),
                None => {}
            }
            let (status, Json(body)) = readiness_handler(State(state.clone())).await;
            assert_eq!(status, expected, "{name}");
            assert_eq!(body["state"], name);
        }
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }
}
