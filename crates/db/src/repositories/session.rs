use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concierge_core::domain::session::{Session, SessionId, SessionStatus};
use concierge_core::store::{decode_session, encode_session, SessionStore, StoreError};
use sqlx::{sqlite::SqliteRow, Row};

use super::{parse_timestamp, parse_u32, RepositoryError};
use crate::DbPool;

/// Sessions persisted as one JSON snapshot per row. The cursor, status and counters are
/// duplicated into columns for listing; the snapshot is authoritative on load.
pub struct SqlSessionStore {
    pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub current_node: String,
    pub status: SessionStatus,
    pub flow: Option<String>,
    pub epoch: u32,
    pub turn_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Most recently updated sessions first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<SessionSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, current_node, status, flow, epoch, turn_count, updated_at
             FROM booking_sessions
             ORDER BY updated_at DESC
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(summary_from_row).collect()
    }

    async fn load_snapshot(&self, session_id: &SessionId) -> Result<Option<String>, RepositoryError> {
        let row = sqlx::query("SELECT state_json FROM booking_sessions WHERE id = ?")
            .bind(session_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get::<String, _>("state_json")).transpose().map_err(Into::into)
    }

    async fn upsert(&self, session: &Session, state_json: String) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO booking_sessions (
                id,
                current_node,
                status,
                flow,
                epoch,
                turn_count,
                state_json,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                current_node = excluded.current_node,
                status = excluded.status,
                flow = excluded.flow,
                epoch = excluded.epoch,
                turn_count = excluded.turn_count,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at",
        )
        .bind(session.id.as_str())
        .bind(session.current_node.as_str())
        .bind(session.status.as_str())
        .bind(session.flow.map(|flow| flow.as_str()))
        .bind(i64::from(session.epoch))
        .bind(i64::try_from(session.turn_count).unwrap_or(i64::MAX))
        .bind(state_json)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn load(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError> {
        match self.load_snapshot(session_id).await? {
            Some(raw) => decode_session(session_id, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let state_json = encode_session(session)?;
        self.upsert(session, state_json).await?;
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM booking_sessions WHERE id = ?")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(result.rows_affected() > 0)
    }
}

fn summary_from_row(row: SqliteRow) -> Result<SessionSummary, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = SessionStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown session status `{status_raw}`")))?;

    Ok(SessionSummary {
        id: SessionId(row.try_get("id")?),
        current_node: row.try_get("current_node")?,
        status,
        flow: row.try_get("flow")?,
        epoch: parse_u32("epoch", row.try_get("epoch")?)?,
        turn_count: parse_u32("turn_count", row.try_get("turn_count")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use concierge_core::domain::session::{FlowBranch, Session, SessionId, SessionStatus};
    use concierge_core::domain::slots::{GroupKey, SlotRecord};
    use concierge_core::flows::{NodeId, NodeRef};
    use concierge_core::store::{SessionStore, StoreError};

    use super::SqlSessionStore;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn sample_session(id: &str) -> Session {
        let mut session = Session::new(SessionId::from(id));
        session.flow = Some(FlowBranch::Booking);
        session.current_node = NodeRef::of(NodeId::ContactInfo);
        session.collected.insert(GroupKey::Product, SlotRecord::new().with("productid", "DEPARTURE"));
        session.drafts.insert(GroupKey::Contact, SlotRecord::new().with("firstname", "Ada"));
        session.record_user("departure lounge please");
        session.turn_count = 3;
        session
    }

    #[tokio::test]
    async fn sql_session_store_round_trips_and_overwrites() {
        let pool = setup_pool().await;
        let store = SqlSessionStore::new(pool.clone());
        let mut session = sample_session("sql-1");

        store.save(&session).await.expect("save");
        assert_eq!(store.load(&session.id).await.expect("load"), Some(session.clone()));

        session.abort();
        session.epoch = 2;
        store.save(&session).await.expect("save again");

        let loaded = store.load(&session.id).await.expect("load").expect("present");
        assert_eq!(loaded.status, SessionStatus::Aborted);
        assert_eq!(loaded.epoch, 2);

        let recent = store.list_recent(10).await.expect("list");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].current_node, "contactInfo");
        assert_eq!(recent[0].status, SessionStatus::Aborted);
        assert_eq!(recent[0].flow.as_deref(), Some("booking"));

        pool.close().await;
    }

    #[tokio::test]
    async fn unknown_session_loads_as_none_and_delete_reports_absence() {
        let pool = setup_pool().await;
        let store = SqlSessionStore::new(pool.clone());
        let id = SessionId::from("absent");

        assert_eq!(store.load(&id).await.expect("load"), None);
        assert!(!store.delete(&id).await.expect("delete"));

        store.save(&sample_session("absent")).await.expect("save");
        assert!(store.delete(&id).await.expect("delete"));
        assert_eq!(store.load(&id).await.expect("load"), None);

        pool.close().await;
    }

    #[tokio::test]
    async fn corrupted_snapshot_is_reported_as_decode_error() {
        let pool = setup_pool().await;
        let store = SqlSessionStore::new(pool.clone());
        store.save(&sample_session("broken")).await.expect("save");
        sqlx::query("UPDATE booking_sessions SET state_json = '{\"id\":' WHERE id = 'broken'")
            .execute(&pool)
            .await
            .expect("tamper");

        let result = store.load(&SessionId::from("broken")).await;
        assert!(matches!(result, Err(StoreError::Decode { .. })));

        pool.close().await;
    }

    #[tokio::test]
    async fn unknown_cursor_is_persisted_verbatim() {
        let pool = setup_pool().await;
        let store = SqlSessionStore::new(pool.clone());
        let mut session = sample_session("odd-cursor");
        session.current_node = NodeRef("retired-node".to_string());

        store.save(&session).await.expect("save");
        let loaded = store.load(&session.id).await.expect("load").expect("present");
        assert_eq!(loaded.current_node.as_str(), "retired-node");

        pool.close().await;
    }
}
