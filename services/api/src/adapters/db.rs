//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `UserStore` port from the `core` crate. Each user is one row holding the
//! whole user document as JSONB plus a revision counter used for conditional writes.

use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use goodnight_core::domain::{
    AgeGroup, ImageJob, ReadStatus, Story, StoryStage, StoryStatus, Subscription, User,
    UserConfig,
};
use goodnight_core::ports::{PortError, PortResult, StoredUser, UserStore, UserStream};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `UserStore` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

/// The document is decoded after the row is fetched, so a malformed document
/// fails only its own user instead of the query it came from.
#[derive(FromRow)]
struct UserRow {
    user_id: String,
    document: Json<serde_json::Value>,
    revision: i64,
}
impl UserRow {
    fn to_domain(self) -> PortResult<StoredUser> {
        let document = serde_json::from_value::<UserDocument>(self.document.0)
            .map_err(|e| invalid(&self.user_id, e))?;
        let user = document.to_domain(self.user_id)?;
        Ok(StoredUser {
            revision: self.revision,
            user,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct UserDocument {
    name: String,
    email: String,
    #[serde(default)]
    profile_picture: String,
    #[serde(default)]
    last_story_generated_timestamp: i64,
    #[serde(default)]
    subscription: SubscriptionRecord,
    #[serde(default)]
    config: ConfigRecord,
    #[serde(default)]
    stories: Vec<StoryRecord>,
}
impl UserDocument {
    fn from_domain(user: &User) -> Self {
        Self {
            name: user.name.clone(),
            email: user.email.clone(),
            profile_picture: user.profile_picture.clone(),
            last_story_generated_timestamp: user.last_story_generated_timestamp,
            subscription: SubscriptionRecord {
                start_date_timestamp: user.subscription.start_date_timestamp,
                end_date_timestamp: user.subscription.end_date_timestamp,
                finished_free_story: user.subscription.finished_free_story,
            },
            config: ConfigRecord {
                genre: user.config.genre.clone(),
                main_character_name: user.config.main_character_name.clone().unwrap_or_default(),
                age_group: user.config.age_group.as_str().to_string(),
            },
            stories: user.stories.iter().map(StoryRecord::from_domain).collect(),
        }
    }

    fn to_domain(self, user_id: String) -> PortResult<User> {
        let age_group = self
            .config
            .age_group
            .parse::<AgeGroup>()
            .map_err(|e| invalid(&user_id, e))?;
        let stories = self
            .stories
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                record
                    .to_domain()
                    .map_err(|e| invalid(&user_id, format!("story {}: {}", index, e)))
            })
            .collect::<PortResult<Vec<Story>>>()?;

        Ok(User {
            name: self.name,
            email: self.email,
            profile_picture: self.profile_picture,
            last_story_generated_timestamp: self.last_story_generated_timestamp,
            subscription: Subscription {
                start_date_timestamp: self.subscription.start_date_timestamp,
                end_date_timestamp: self.subscription.end_date_timestamp,
                finished_free_story: self.subscription.finished_free_story,
            },
            config: UserConfig {
                genre: self.config.genre,
                main_character_name: Some(self.config.main_character_name)
                    .filter(|name| !name.is_empty()),
                age_group,
            },
            stories,
            user_id,
        })
    }
}

fn invalid(user_id: &str, reason: impl std::fmt::Display) -> PortError {
    PortError::Unexpected(format!("Invalid document for user {}: {}", user_id, reason))
}

#[derive(Serialize, Deserialize, Default)]
struct SubscriptionRecord {
    start_date_timestamp: i64,
    end_date_timestamp: i64,
    finished_free_story: bool,
}

#[derive(Serialize, Deserialize)]
struct ConfigRecord {
    genre: String,
    #[serde(default)]
    main_character_name: String,
    #[serde(default)]
    age_group: String,
}
impl Default for ConfigRecord {
    fn default() -> Self {
        let config = UserConfig::default();
        Self {
            genre: config.genre,
            main_character_name: String::new(),
            age_group: config.age_group.as_str().to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct StoryRecord {
    prompt: String,
    #[serde(default)]
    generated_story: String,
    #[serde(default)]
    generated_summary: String,
    #[serde(default)]
    image_url: String,
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fetch_image_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fetch_image_id: Option<String>,
    #[serde(default = "unread")]
    read_status: String,
    status: String,
}

fn unread() -> String {
    ReadStatus::Unread.as_str().to_string()
}

impl StoryRecord {
    fn from_domain(story: &Story) -> Self {
        let job = story.status.image_job();
        Self {
            prompt: story.prompt.clone(),
            generated_story: story.generated_story.clone(),
            generated_summary: story.generated_summary.clone(),
            image_url: story.image_url.clone(),
            timestamp: story.timestamp,
            fetch_image_timestamp: job.map(|job| job.ready_at),
            fetch_image_id: job.map(|job| job.id.clone()),
            read_status: story.read_status.as_str().to_string(),
            status: story.status.stage().as_str().to_string(),
        }
    }

    /// Decodes the flat stored shape, enforcing that the queued job fields are
    /// present exactly when the story waits on the job.
    fn to_domain(self) -> Result<Story, String> {
        let stage = self.status.parse::<StoryStage>()?;
        let read_status = self.read_status.parse::<ReadStatus>()?;
        let job_id = self.fetch_image_id.filter(|id| !id.is_empty());

        let status = match (stage, job_id, self.fetch_image_timestamp) {
            (StoryStage::PendingImageFetch, Some(id), Some(ready_at)) => {
                StoryStatus::PendingImageFetch(ImageJob { id, ready_at })
            }
            (StoryStage::PendingImageFetch, _, _) => {
                return Err("PendingImageFetch story is missing its image job".to_string())
            }
            (_, Some(_), _) => {
                return Err(format!("{} story must not carry an image job", stage))
            }
            // Older documents store a zero timestamp on every story.
            (_, None, Some(ready_at)) if ready_at != 0 => {
                return Err(format!("{} story must not carry an image due time", stage))
            }
            (StoryStage::PendingTextGeneration, None, _) => StoryStatus::PendingTextGeneration,
            (StoryStage::PendingImageGeneration, None, _) => StoryStatus::PendingImageGeneration,
            (StoryStage::StoryReady, None, _) => StoryStatus::StoryReady,
        };

        Ok(Story {
            prompt: self.prompt,
            generated_story: self.generated_story,
            generated_summary: self.generated_summary,
            image_url: self.image_url,
            timestamp: self.timestamp,
            read_status,
            status,
        })
    }
}

//=========================================================================================
// `UserStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl UserStore for DbAdapter {
    async fn get_user(&self, user_id: &str) -> PortResult<Option<StoredUser>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT user_id, document, revision FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        row.map(UserRow::to_domain).transpose()
    }

    async fn create_user(&self, user: User) -> PortResult<bool> {
        let result = sqlx::query(
            "INSERT INTO users (user_id, document, revision) VALUES ($1, $2, 1) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(&user.user_id)
        .bind(Json(UserDocument::from_domain(&user)))
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(result.rows_affected() == 1)
    }

    async fn replace_user(&self, user: &User, expected_revision: i64) -> PortResult<i64> {
        let revision: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET document = $1, revision = revision + 1, updated_at = now() \
             WHERE user_id = $2 AND revision = $3 RETURNING revision",
        )
        .bind(Json(UserDocument::from_domain(user)))
        .bind(&user.user_id)
        .bind(expected_revision)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        if let Some(revision) = revision {
            return Ok(revision);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM users WHERE user_id = $1)")
            .bind(&user.user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(unexpected)?;

        if exists {
            Err(PortError::Conflict(format!(
                "User {} moved past revision {}",
                user.user_id, expected_revision
            )))
        } else {
            Err(PortError::NotFound(format!("User {} not found", user.user_id)))
        }
    }

    fn stream_users(&self) -> UserStream<'_> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT user_id, document, revision FROM users ORDER BY user_id",
        )
        .fetch(&self.pool);
        decode_rows(rows)
    }
}

/// Turns fetched rows into users. A row that does not decode is reported and
/// skipped; a database error ends the stream.
fn decode_rows<'a, S>(rows: S) -> UserStream<'a>
where
    S: Stream<Item = Result<UserRow, sqlx::Error>> + Send + 'a,
{
    Box::pin(stream! {
        let mut rows = Box::pin(rows);
        while let Some(row) = rows.next().await {
            match row {
                Ok(row) => yield row.to_domain(),
                Err(e) => {
                    yield Err(unexpected(e));
                    break;
                }
            }
        }
    })
}
