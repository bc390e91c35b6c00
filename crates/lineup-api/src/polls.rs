use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;

use lineup_core::gateway::MessagingGateway;
use lineup_core::results::Shuffler;
use lineup_types::api::{HealthResponse, PollResponse};

use crate::state::AppState;

/// Liveness plus a trivial query against the database.
pub async fn healthz<G: MessagingGateway, S: Shuffler>(
    State(state): State<AppState<G, S>>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .db
        .call(|db| db.with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?)))
        .await
        .map_err(|e| {
            error!("Health check failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    Ok(Json(HealthResponse { status: "ok" }))
}

/// Current state of one poll, with its results once processed.
pub async fn get_poll<G: MessagingGateway, S: Shuffler>(
    State(state): State<AppState<G, S>>,
    Path(poll_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let found = state
        .db
        .call(move |db| {
            let Some(poll) = db.get_poll(&poll_id)? else {
                return Ok(None);
            };
            let result = db.get_result(&poll_id)?;
            Ok(Some((poll, result)))
        })
        .await
        .map_err(|e| {
            error!("Poll lookup failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let (poll, result) = found.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(PollResponse::new(poll, result.map(|r| r.results_text))))
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use chrono::{TimeDelta, Utc};
    use tower::ServiceExt;

    use lineup_types::models::{Identity, Poll};

    use crate::router;
    use crate::test_support::state;

    async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let res = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), 1 << 20).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_healthz() {
        let (state, _) = state(None);
        let (status, body) = get(router(state, false), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_get_poll_reports_status_and_results() {
        let (state, _) = state(None);
        let poll = Poll::new_active(
            "p1".into(),
            -7,
            3,
            "Practice".into(),
            Identity::new(1, Some("coach".into()), None),
            Utc::now() - TimeDelta::hours(1),
            TimeDelta::minutes(30),
        );
        state.db.register_poll(&poll).unwrap();

        let (status, body) = get(router(state.clone(), false), "/polls/p1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
        assert!(body["results_text"].is_null());

        state.db.mark_processed("p1", "Results for: Practice\n", 44, Utc::now()).unwrap();
        let (_, body) = get(router(state, false), "/polls/p1").await;
        assert_eq!(body["status"], "processed");
        assert_eq!(body["results_message_id"], 44);
        assert_eq!(body["results_text"], "Results for: Practice\n");
    }

    #[tokio::test]
    async fn test_unknown_poll_is_404() {
        let (state, _) = state(None);
        let (status, _) = get(router(state, false), "/polls/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
