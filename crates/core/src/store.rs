use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::session::{Session, SessionId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session store backend failure: {0}")]
    Backend(String),
    #[error("session `{session_id}` could not be decoded: {reason}")]
    Decode { session_id: String, reason: String },
    #[error("session could not be encoded: {0}")]
    Encode(String),
}

/// Durable session persistence. `save` must be durable before it returns.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError>;
    async fn save(&self, session: &Session) -> Result<(), StoreError>;
    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError>;
}

pub fn encode_session(session: &Session) -> Result<String, StoreError> {
    serde_json::to_string(session).map_err(|error| StoreError::Encode(error.to_string()))
}

pub fn decode_session(session_id: &SessionId, raw: &str) -> Result<Session, StoreError> {
    serde_json::from_str(raw).map_err(|error| StoreError::Decode {
        session_id: session_id.to_string(),
        reason: error.to_string(),
    })
}

/// Keeps JSON snapshots so every load goes through the same decoding path as a real store.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    snapshots: Arc<Mutex<HashMap<SessionId, String>>>,
}

impl InMemorySessionStore {
    /// Stores a raw snapshot as-is. Lets tests plant tampered sessions.
    pub fn put_raw(&self, session_id: SessionId, raw: impl Into<String>) {
        let mut snapshots = match self.snapshots.lock() {
            Ok(snapshots) => snapshots,
            Err(poisoned) => poisoned.into_inner(),
        };
        snapshots.insert(session_id, raw.into());
    }

    pub fn raw(&self, session_id: &SessionId) -> Option<String> {
        let snapshots = match self.snapshots.lock() {
            Ok(snapshots) => snapshots,
            Err(poisoned) => poisoned.into_inner(),
        };
        snapshots.get(session_id).cloned()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError> {
        match self.raw(session_id) {
            Some(raw) => decode_session(session_id, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let raw = encode_session(session)?;
        self.put_raw(session.id.clone(), raw);
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let mut snapshots = match self.snapshots.lock() {
            Ok(snapshots) => snapshots,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(snapshots.remove(session_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemorySessionStore, SessionStore, StoreError};
    use crate::domain::session::{Session, SessionId};
    use crate::domain::slots::{GroupKey, SlotRecord};
    use crate::flows::states::{NodeId, NodeRef};

    #[tokio::test]
    async fn saved_session_loads_back_identically() {
        let store = InMemorySessionStore::default();
        let mut session = Session::new(SessionId::from("store-1"));
        session.current_node = NodeRef::of(NodeId::ContactInfo);
        session.collected.insert(GroupKey::Tickets, SlotRecord::new().with("adulttickets", 2));
        session.record_user("two adults please");

        store.save(&session).await.expect("save");
        let loaded = store.load(&session.id).await.expect("load").expect("present");

        assert_eq!(loaded, session);
    }

    #[tokio::test]
    async fn unknown_cursor_survives_decoding() {
        let store = InMemorySessionStore::default();
        let mut session = Session::new(SessionId::from("store-2"));
        session.current_node = NodeRef("no-such-node".to_owned());
        store.save(&session).await.expect("save");

        let loaded = store.load(&session.id).await.expect("load").expect("present");
        assert_eq!(loaded.current_node.as_str(), "no-such-node");
    }

    #[tokio::test]
    async fn malformed_snapshot_is_a_decode_error() {
        let store = InMemorySessionStore::default();
        let id = SessionId::from("store-3");
        store.put_raw(id.clone(), "{not json");

        let error = store.load(&id).await.expect_err("decode must fail");
        assert!(matches!(error, StoreError::Decode { .. }));
        assert!(store.delete(&id).await.expect("delete"));
        assert_eq!(store.load(&id).await.expect("load"), None);
    }
}
