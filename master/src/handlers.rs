use axum::{extract::State, routing::get, Json, Router};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use common::StatusSnapshot;

/// Los handlers solo leen la última foto que publicó el coordinador.
#[derive(Clone)]
pub struct StatusState {
    pub snapshot: watch::Receiver<StatusSnapshot>,
}

pub fn build_router(snapshot: watch::Receiver<StatusSnapshot>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(StatusState { snapshot })
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Estado del job, conteo de tareas y workers
async fn status(State(state): State<StatusState>) -> Json<StatusSnapshot> {
    Json(state.snapshot.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use common::{JobPhase, WorkerState, WorkerStatus};
    use tower::ServiceExt;

    async fn get_body(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let res = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let (_tx, rx) = watch::channel(StatusSnapshot::default());
        let (status, body) = get_body(build_router(rx), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn status_serves_the_latest_snapshot() {
        let (tx, rx) = watch::channel(StatusSnapshot::default());
        let app = build_router(rx);

        let mut snap = StatusSnapshot {
            phase: JobPhase::Mapping,
            utilization: Some(0.5),
            ..StatusSnapshot::default()
        };
        snap.tasks.running = 2;
        snap.workers.push(WorkerStatus {
            worker_id: 7,
            peer: "127.0.0.1:5000".into(),
            state: WorkerState::Running,
            task: Some(3),
            progress: 120,
            rate: Some(40.0),
            chunk_size: 500,
            pending_acks: 0,
            last_heartbeat_secs_ago: 1,
        });
        tx.send(snap).unwrap();

        let (status, body) = get_body(app, "/api/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["phase"], "MAPPING");
        assert_eq!(json["tasks"]["running"], 2);
        assert_eq!(json["workers"][0]["state"], "RUNNING");
        assert_eq!(json["workers"][0]["worker_id"], 7);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (_tx, rx) = watch::channel(StatusSnapshot::default());
        let (status, _) = get_body(build_router(rx), "/api/v1/jobs").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
