//! crates/goodnight_core/src/store.rs
//!
//! The read-modify-write cycle every writer of a user document goes through.

use crate::domain::User;
use crate::ports::{PortError, UserStore};
use tracing::debug;

/// How many times a mutation is replayed after losing a revision race.
pub const MAX_WRITE_ATTEMPTS: usize = 5;

/// Atomically applies `apply` to the stored user.
///
/// The user is re-read on every attempt and written back only if its revision
/// has not moved in between. `apply` returning `Ok(None)` means there is
/// nothing to write; the store is left untouched and `Ok(None)` is returned.
/// `apply` may run more than once, so it must not have side effects outside
/// the user it is handed.
pub async fn mutate_user<T, E, F>(
    store: &dyn UserStore,
    user_id: &str,
    mut apply: F,
) -> Result<Option<T>, E>
where
    F: FnMut(&mut User) -> Result<Option<T>, E> + Send,
    T: Send,
    E: From<PortError> + Send,
{
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        let stored = store
            .get_user(user_id)
            .await?
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))?;

        let mut user = stored.user;
        let Some(outcome) = apply(&mut user)? else {
            return Ok(None);
        };

        match store.replace_user(&user, stored.revision).await {
            Ok(_) => return Ok(Some(outcome)),
            Err(PortError::Conflict(reason)) => {
                debug!(user_id, attempt, %reason, "User write lost a race, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(PortError::Conflict(format!(
        "User {} kept changing after {} attempts",
        user_id, MAX_WRITE_ATTEMPTS
    ))
    .into())
}
