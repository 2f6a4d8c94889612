use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use concierge_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    booking_api_mode: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    /// Sessions still waiting on the customer; absent when the database is unreachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_sessions: Option<i64>,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, booking_api_mode: &'static str) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(HealthState { db_pool, booking_api_mode })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let (database, active_sessions) = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: format!("concierge-server accepting turns ({} booking api)", state.booking_api_mode),
        },
        database,
        active_sessions,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> (HealthCheck, Option<i64>) {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM booking_sessions WHERE status = 'active'")
        .fetch_one(pool)
        .await
    {
        Ok(active) => (
            HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
            Some(active),
        ),
        Err(error) => (
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") },
            None,
        ),
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, http::StatusCode, Json};
    use concierge_db::{connect_with_settings, migrations};

    use crate::health::{health, HealthState};

    #[tokio::test]
    async fn health_returns_ready_when_database_is_reachable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrate");

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool.clone(), booking_api_mode: "sandbox" })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.service.status, "ready");
        assert_eq!(payload.active_sessions, Some(0));
        assert!(payload.service.detail.contains("sandbox"));

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        pool.close().await;

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool, booking_api_mode: "http" })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.active_sessions, None);
        assert_eq!(payload.service.status, "ready");
    }
}
