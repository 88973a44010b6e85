//! crates/goodnight_core/src/memory.rs
//!
//! A process-local `UserStore`, used for development runs without a database
//! and as the backing store of the test suites.

use crate::domain::User;
use crate::ports::{PortError, PortResult, StoredUser, UserStore, UserStream};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    users: Mutex<BTreeMap<String, StoredUser>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> PortResult<std::sync::MutexGuard<'_, BTreeMap<String, StoredUser>>> {
        self.users
            .lock()
            .map_err(|_| PortError::Unexpected("In-memory user store lock poisoned".to_string()))
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get_user(&self, user_id: &str) -> PortResult<Option<StoredUser>> {
        Ok(self.lock()?.get(user_id).cloned())
    }

    async fn create_user(&self, user: User) -> PortResult<bool> {
        let mut users = self.lock()?;
        if users.contains_key(&user.user_id) {
            return Ok(false);
        }
        users.insert(user.user_id.clone(), StoredUser { revision: 1, user });
        Ok(true)
    }

    async fn replace_user(&self, user: &User, expected_revision: i64) -> PortResult<i64> {
        let mut users = self.lock()?;
        let stored = users
            .get_mut(&user.user_id)
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user.user_id)))?;
        if stored.revision != expected_revision {
            return Err(PortError::Conflict(format!(
                "User {} is at revision {}, expected {}",
                user.user_id, stored.revision, expected_revision
            )));
        }
        stored.revision += 1;
        stored.user = user.clone();
        Ok(stored.revision)
    }

    fn stream_users(&self) -> UserStream<'_> {
        let snapshot: Vec<PortResult<StoredUser>> = match self.lock() {
            Ok(users) => users.values().cloned().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        };
        Box::pin(futures::stream::iter(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mutate_user;
    use futures::StreamExt;

    fn user(id: &str) -> User {
        User::new(id.to_string(), "Name".into(), "n@example.com".into(), String::new())
    }

    #[tokio::test]
    async fn create_is_a_no_op_for_existing_ids() {
        let store = InMemoryUserStore::new();
        assert!(store.create_user(user("u1")).await.unwrap());

        let mut renamed = user("u1");
        renamed.name = "Other".to_string();
        assert!(!store.create_user(renamed).await.unwrap());

        let stored = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(stored.user.name, "Name");
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn stale_revision_is_a_conflict() {
        let store = InMemoryUserStore::new();
        store.create_user(user("u1")).await.unwrap();
        let stored = store.get_user("u1").await.unwrap().unwrap();

        store.replace_user(&stored.user, stored.revision).await.unwrap();
        let err = store
            .replace_user(&stored.user, stored.revision)
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Conflict(_)));
    }

    #[tokio::test]
    async fn mutate_user_skips_write_when_nothing_changes() {
        let store = InMemoryUserStore::new();
        store.create_user(user("u1")).await.unwrap();

        let outcome: Option<()> = mutate_user::<(), PortError, _>(&store, "u1", |_| Ok(None))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(store.get_user("u1").await.unwrap().unwrap().revision, 1);

        mutate_user::<(), PortError, _>(&store, "u1", |user| {
            user.name = "Renamed".to_string();
            Ok(Some(()))
        })
        .await
        .unwrap();
        let stored = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.user.name, "Renamed");
    }

    #[tokio::test]
    async fn mutate_user_reports_missing_user() {
        let store = InMemoryUserStore::new();
        let err = mutate_user::<(), PortError, _>(&store, "ghost", |_| Ok(Some(())))
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::NotFound(_)));
    }

    #[tokio::test]
    async fn users_stream_in_id_order() {
        let store = InMemoryUserStore::new();
        for id in ["b", "a", "c"] {
            store.create_user(user(id)).await.unwrap();
        }
        let ids: Vec<String> = store
            .stream_users()
            .map(|item| item.unwrap().user.user_id)
            .collect()
            .await;
        assert_eq!(ids, ["a", "b", "c"]);
    }
}
