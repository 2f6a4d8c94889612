use async_trait::async_trait;
use concierge_core::domain::session::SessionId;
use concierge_core::ledger::{LedgerEntry, LedgerError, LedgerState, OperationKey, SideEffectLedger};
use sqlx::{sqlite::SqliteRow, Row};

use super::{parse_timestamp, parse_u32, RepositoryError};
use crate::DbPool;

pub struct SqlSideEffectLedger {
    pool: DbPool,
}

impl SqlSideEffectLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SideEffectLedger for SqlSideEffectLedger {
    async fn find(&self, key: &OperationKey) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(
            "SELECT
                operation_key,
                session_id,
                operation_kind,
                payload_hash,
                state,
                attempt_count,
                result_snapshot_json,
                error_snapshot,
                correlation_id,
                first_seen_at,
                last_seen_at
             FROM side_effect_ledger
             WHERE operation_key = ?",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.map(entry_from_row).transpose()?)
    }

    async fn record(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let result_snapshot = entry
            .result_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| LedgerError::Serialization(error.to_string()))?;

        sqlx::query(
            "INSERT INTO side_effect_ledger (
                operation_key,
                session_id,
                operation_kind,
                payload_hash,
                state,
                attempt_count,
                result_snapshot_json,
                error_snapshot,
                correlation_id,
                first_seen_at,
                last_seen_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(operation_key) DO UPDATE SET
                payload_hash = excluded.payload_hash,
                state = excluded.state,
                attempt_count = excluded.attempt_count,
                result_snapshot_json = excluded.result_snapshot_json,
                error_snapshot = excluded.error_snapshot,
                correlation_id = excluded.correlation_id,
                last_seen_at = excluded.last_seen_at",
        )
        .bind(entry.operation_key.as_str())
        .bind(entry.session_id.as_str())
        .bind(&entry.operation_kind)
        .bind(&entry.payload_hash)
        .bind(entry.state.as_str())
        .bind(i64::from(entry.attempt_count))
        .bind(result_snapshot)
        .bind(entry.error_snapshot.as_deref())
        .bind(&entry.correlation_id)
        .bind(entry.first_seen_at.to_rfc3339())
        .bind(entry.last_seen_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn entries_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query(
            "SELECT
                operation_key,
                session_id,
                operation_kind,
                payload_hash,
                state,
                attempt_count,
                result_snapshot_json,
                error_snapshot,
                correlation_id,
                first_seen_at,
                last_seen_at
             FROM side_effect_ledger
             WHERE session_id = ?
             ORDER BY first_seen_at ASC, operation_key ASC",
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(entry_from_row).collect::<Result<Vec<_>, _>>()?)
    }
}

fn entry_from_row(row: SqliteRow) -> Result<LedgerEntry, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let state = LedgerState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown ledger state `{state_raw}`")))?;
    let result_snapshot = row
        .try_get::<Option<String>, _>("result_snapshot_json")?
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|error| {
                RepositoryError::Decode(format!("invalid result snapshot json: {error}"))
            })
        })
        .transpose()?;

    Ok(LedgerEntry {
        operation_key: OperationKey(row.try_get("operation_key")?),
        session_id: SessionId(row.try_get("session_id")?),
        operation_kind: row.try_get("operation_kind")?,
        payload_hash: row.try_get("payload_hash")?,
        state,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        result_snapshot,
        error_snapshot: row.try_get("error_snapshot")?,
        correlation_id: row.try_get("correlation_id")?,
        first_seen_at: parse_timestamp("first_seen_at", row.try_get("first_seen_at")?)?,
        last_seen_at: parse_timestamp("last_seen_at", row.try_get("last_seen_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use concierge_core::domain::session::SessionId;
    use concierge_core::ledger::{
        LedgerEntry, LedgerState, OperationKey, OperationKind, SideEffectLedger,
    };
    use serde_json::json;

    use super::SqlSideEffectLedger;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn in_flight(session: &SessionId, kind: OperationKind) -> LedgerEntry {
        LedgerEntry::in_flight(
            OperationKey::new(session, &kind, 0),
            session.clone(),
            kind.name(),
            "hash-1",
            "corr-1",
        )
    }

    #[tokio::test]
    async fn sql_ledger_tracks_an_entry_through_its_states() {
        let pool = setup_pool().await;
        let ledger = SqlSideEffectLedger::new(pool.clone());
        let session = SessionId::from("ledger-1");
        let entry = in_flight(&session, OperationKind::ReserveCart);

        ledger.record(&entry).await.expect("record in flight");
        let found = ledger.find(&entry.operation_key).await.expect("find").expect("present");
        assert_eq!(found.state, LedgerState::InFlight);
        assert_eq!(found.result_snapshot, None);

        let failed = found.failed("status 502");
        ledger.record(&failed).await.expect("record failure");
        let retried = failed.retried("hash-1", "corr-2");
        let completed = retried.completed(json!({ "cartItemId": 5001 }));
        ledger.record(&completed).await.expect("record completion");

        let stored = ledger.find(&entry.operation_key).await.expect("find").expect("present");
        assert_eq!(stored.state, LedgerState::Completed);
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.correlation_id, "corr-2");
        assert_eq!(stored.error_snapshot, None);
        assert_eq!(stored.result_snapshot, Some(json!({ "cartItemId": 5001 })));
        assert_eq!(stored, completed);

        pool.close().await;
    }

    #[tokio::test]
    async fn entries_are_listed_per_session() {
        let pool = setup_pool().await;
        let ledger = SqlSideEffectLedger::new(pool.clone());
        let first = SessionId::from("ledger-a");
        let second = SessionId::from("ledger-b");

        ledger.record(&in_flight(&first, OperationKind::ReserveCart)).await.expect("record");
        ledger.record(&in_flight(&first, OperationKind::SetContact)).await.expect("record");
        ledger.record(&in_flight(&second, OperationKind::MakePayment)).await.expect("record");

        let entries = ledger.entries_for_session(&first).await.expect("entries");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| entry.session_id == first));
        assert!(ledger
            .find(&OperationKey::new(&second, &OperationKind::ReserveCart, 0))
            .await
            .expect("find")
            .is_none());

        pool.close().await;
    }
}
