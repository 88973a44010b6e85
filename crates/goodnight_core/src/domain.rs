//! crates/goodnight_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or serialization format.

use std::fmt;
use std::str::FromStr;

/// Position of a story inside its owner's story list.
pub type StoryId = usize;

pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// The audience a story should be written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgeGroup {
    Children,
    Teens,
    #[default]
    Adults,
}

impl AgeGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeGroup::Children => "children",
            AgeGroup::Teens => "teens",
            AgeGroup::Adults => "adults",
        }
    }
}

impl FromStr for AgeGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "children" => Ok(AgeGroup::Children),
            "teens" => Ok(AgeGroup::Teens),
            "adults" => Ok(AgeGroup::Adults),
            other => Err(format!("unknown age group '{}'", other)),
        }
    }
}

/// Per-user story preferences, used when a request does not name its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserConfig {
    pub genre: String,
    pub main_character_name: Option<String>,
    pub age_group: AgeGroup,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            genre: "adventure".to_string(),
            main_character_name: None,
            age_group: AgeGroup::Adults,
        }
    }
}

/// Paid period of a user plus the one free story granted after it ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub start_date_timestamp: i64,
    pub end_date_timestamp: i64,
    pub finished_free_story: bool,
}

impl Subscription {
    pub fn is_expired(&self, now: i64) -> bool {
        self.end_date_timestamp < now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadStatus {
    #[default]
    Unread,
    Read,
}

impl ReadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadStatus::Unread => "unread",
            ReadStatus::Read => "read",
        }
    }
}

impl FromStr for ReadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(ReadStatus::Unread),
            "read" => Ok(ReadStatus::Read),
            other => Err(format!("unknown read status '{}'", other)),
        }
    }
}

/// A queued image job handed back by the image gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageJob {
    pub id: String,
    /// Epoch seconds at which the job is expected to be ready.
    pub ready_at: i64,
}

/// Where a story currently is in its lifecycle.
///
/// The queued image job only exists while the story waits on it, so it lives
/// inside the `PendingImageFetch` variant rather than beside the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoryStatus {
    PendingTextGeneration,
    PendingImageGeneration,
    PendingImageFetch(ImageJob),
    StoryReady,
}

impl StoryStatus {
    pub fn stage(&self) -> StoryStage {
        match self {
            StoryStatus::PendingTextGeneration => StoryStage::PendingTextGeneration,
            StoryStatus::PendingImageGeneration => StoryStage::PendingImageGeneration,
            StoryStatus::PendingImageFetch(_) => StoryStage::PendingImageFetch,
            StoryStatus::StoryReady => StoryStage::StoryReady,
        }
    }

    pub fn image_job(&self) -> Option<&ImageJob> {
        match self {
            StoryStatus::PendingImageFetch(job) => Some(job),
            _ => None,
        }
    }
}

/// The fieldless name of a [`StoryStatus`], used for filtering and storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoryStage {
    PendingTextGeneration,
    PendingImageGeneration,
    PendingImageFetch,
    StoryReady,
}

impl StoryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStage::PendingTextGeneration => "PendingTextGeneration",
            StoryStage::PendingImageGeneration => "PendingImageGeneration",
            StoryStage::PendingImageFetch => "PendingImageFetch",
            StoryStage::StoryReady => "StoryReady",
        }
    }

    /// Whether `next` is a legal successor of this stage.
    pub fn can_advance_to(self, next: StoryStage) -> bool {
        use StoryStage::*;
        matches!(
            (self, next),
            (PendingTextGeneration, PendingImageGeneration)
                | (PendingImageGeneration, PendingImageFetch)
                | (PendingImageGeneration, StoryReady)
                | (PendingImageFetch, StoryReady)
        )
    }
}

impl fmt::Display for StoryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoryStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PendingTextGeneration" => Ok(StoryStage::PendingTextGeneration),
            "PendingImageGeneration" => Ok(StoryStage::PendingImageGeneration),
            "PendingImageFetch" => Ok(StoryStage::PendingImageFetch),
            "StoryReady" => Ok(StoryStage::StoryReady),
            other => Err(format!("unknown story status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid story transition from {from} to {to}")]
pub struct TransitionError {
    pub from: StoryStage,
    pub to: StoryStage,
}

/// A single personalized story and its illustration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Story {
    pub prompt: String,
    pub generated_story: String,
    pub generated_summary: String,
    pub image_url: String,
    /// Creation time, refreshed when a queued illustration completes.
    pub timestamp: i64,
    pub read_status: ReadStatus,
    pub status: StoryStatus,
}

impl Story {
    /// A freshly requested story, waiting for its text.
    pub fn new(prompt: String, now: i64) -> Self {
        Self {
            prompt,
            generated_story: String::new(),
            generated_summary: String::new(),
            image_url: String::new(),
            timestamp: now,
            read_status: ReadStatus::Unread,
            status: StoryStatus::PendingTextGeneration,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == StoryStatus::StoryReady
    }

    pub fn is_ready_and_read(&self) -> bool {
        self.is_ready() && self.read_status == ReadStatus::Read
    }

    /// Moves the story to `next`, refusing backward or skipping moves.
    pub fn advance(&mut self, next: StoryStatus) -> Result<(), TransitionError> {
        let from = self.status.stage();
        let to = next.stage();
        if !from.can_advance_to(to) {
            return Err(TransitionError { from, to });
        }
        self.status = next;
        Ok(())
    }
}

/// A registered user and the stories they own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub profile_picture: String,
    /// Epoch seconds of the last accepted story request.
    pub last_story_generated_timestamp: i64,
    pub subscription: Subscription,
    pub config: UserConfig,
    /// Append-only; the index of a story is its id.
    pub stories: Vec<Story>,
}

impl User {
    pub fn new(user_id: String, name: String, email: String, profile_picture: String) -> Self {
        Self {
            user_id,
            name,
            email,
            profile_picture,
            last_story_generated_timestamp: 0,
            subscription: Subscription::default(),
            config: UserConfig::default(),
            stories: Vec::new(),
        }
    }

    pub fn latest_story(&self) -> Option<&Story> {
        self.stories.last()
    }

    /// The newest story whose illustration is done.
    pub fn latest_ready_story(&self) -> Option<(StoryId, &Story)> {
        self.stories
            .iter()
            .enumerate()
            .rev()
            .find(|(_, story)| story.is_ready())
    }

    /// Stories currently sitting in `stage`, in list order.
    pub fn stories_in_stage(&self, stage: StoryStage) -> impl Iterator<Item = (StoryId, &Story)> {
        self.stories
            .iter()
            .enumerate()
            .filter(move |(_, story)| story.status.stage() == stage)
    }
}
