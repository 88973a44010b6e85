//! crates/goodnight_core/src/intake.rs
//!
//! Turns a story request into a new `PendingTextGeneration` story.

use crate::domain::{Story, StoryId};
use crate::ports::{PortError, UserStore};
use crate::prompts::build_prompt;
use crate::quota::{check_quota, QuotaDenial};
use crate::store::mutate_user;
use tracing::info;

/// Longest genre or protagonist name accepted in a request.
pub const MAX_FIELD_LEN: usize = 64;

/// What the caller asked for. Missing fields fall back to the user's stored config.
#[derive(Debug, Clone, Default)]
pub struct StoryRequest {
    pub genre: Option<String>,
    pub main_character_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryReceipt {
    pub story_id: StoryId,
    pub prompt: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Story request denied: {0}")]
    Quota(#[from] QuotaDenial),
    #[error("{0}")]
    NotFound(String),
    #[error("Invalid story request: {0}")]
    Validation(String),
    #[error(transparent)]
    Port(PortError),
}

impl From<PortError> for IntakeError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::NotFound(message) => IntakeError::NotFound(message),
            other => IntakeError::Port(other),
        }
    }
}

fn validate_field(name: &str, value: &str) -> Result<(), IntakeError> {
    if value.chars().count() > MAX_FIELD_LEN {
        return Err(IntakeError::Validation(format!(
            "{} must be at most {} characters",
            name, MAX_FIELD_LEN
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(IntakeError::Validation(format!(
            "{} must not contain control characters",
            name
        )));
    }
    Ok(())
}

/// Validates `request`, consults the quota gate and appends the new story.
///
/// The story, the request timestamp and any subscription side effect are
/// written together in one atomic update of the user document.
pub async fn request_story(
    store: &dyn UserStore,
    now: i64,
    user_id: &str,
    request: &StoryRequest,
) -> Result<StoryReceipt, IntakeError> {
    if let Some(genre) = &request.genre {
        validate_field("genre", genre)?;
    }
    if let Some(name) = &request.main_character_name {
        validate_field("main_character_name", name)?;
    }

    let receipt = mutate_user(store, user_id, |user| {
        let genre = request
            .genre
            .clone()
            .unwrap_or_else(|| user.config.genre.clone());
        if genre.trim().is_empty() {
            return Err(IntakeError::Validation("genre must not be empty".to_string()));
        }
        validate_field("genre", &genre)?;

        let main_character = request
            .main_character_name
            .clone()
            .or_else(|| user.config.main_character_name.clone());

        let grant = check_quota(
            now,
            &user.subscription,
            user.last_story_generated_timestamp,
            user.latest_story(),
        )?;

        let prompt = build_prompt(&genre, main_character.as_deref(), Some(user.config.age_group));
        user.stories.push(Story::new(prompt.clone(), now));
        user.last_story_generated_timestamp = now;
        grant.apply(&mut user.subscription);

        Ok(Some(StoryReceipt {
            story_id: user.stories.len() - 1,
            prompt,
        }))
    })
    .await?
    .ok_or_else(|| IntakeError::Port(PortError::Unexpected("Story was not recorded".to_string())))?;

    info!(user_id, story_id = receipt.story_id, "Story requested");
    Ok(receipt)
}
