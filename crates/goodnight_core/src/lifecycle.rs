//! crates/goodnight_core/src/lifecycle.rs
//!
//! The story lifecycle engine. Each tick method is the body of one periodic
//! worker; a worker only ever touches stories sitting in the stage it owns,
//! and every transition is committed with a revision-checked write of the
//! owning user document.

use crate::clock::Clock;
use crate::domain::{ImageJob, Story, StoryId, StoryStage, StoryStatus, TransitionError};
use crate::intake::{request_story, IntakeError, StoryRequest};
use crate::ports::{
    ImageGeneration, ImageGenerationService, PortError, PortResult, TextGenerationService,
    UserStore,
};
use crate::prompts::build_summary_prompt;
use crate::store::mutate_user;
use futures::StreamExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

//=========================================================================================
// Settings and Reports
//=========================================================================================

/// Knobs for the generation calls made by the workers.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub story_temperature: f32,
    pub story_max_tokens: u32,
    pub summary_temperature: f32,
    pub summary_max_tokens: u32,
    /// Upper bound on every single gateway call.
    pub gateway_timeout: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            story_temperature: 0.9,
            story_max_tokens: 400,
            summary_temperature: 0.9,
            summary_max_tokens: 25,
            gateway_timeout: Duration::from_secs(60),
        }
    }
}

/// The periodic workers driving stories forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Worker {
    TextGeneration,
    ImageGeneration,
    ImageFetch,
    StoryRequest,
}

impl Worker {
    pub const ALL: [Worker; 4] = [
        Worker::TextGeneration,
        Worker::ImageGeneration,
        Worker::ImageFetch,
        Worker::StoryRequest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Worker::TextGeneration => "text_generation",
            Worker::ImageGeneration => "image_generation",
            Worker::ImageFetch => "image_fetch",
            Worker::StoryRequest => "story_request",
        }
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Stories moved to their next stage (or created, for story requests).
    pub advanced: usize,
    /// Stories left in place because a gateway or store call failed.
    pub failed: usize,
    /// Candidates that turned out to need nothing this tick.
    pub skipped: usize,
}

/// A story found in the stage a worker owns, as it looked when the tick read it.
#[derive(Debug, Clone)]
struct Candidate {
    user_id: String,
    story_id: StoryId,
    story: Story,
}

//=========================================================================================
// The Engine
//=========================================================================================

pub struct LifecycleEngine {
    store: Arc<dyn UserStore>,
    text: Arc<dyn TextGenerationService>,
    image: Arc<dyn ImageGenerationService>,
    clock: Arc<dyn Clock>,
    settings: GenerationSettings,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn UserStore>,
        text: Arc<dyn TextGenerationService>,
        image: Arc<dyn ImageGenerationService>,
        clock: Arc<dyn Clock>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            store,
            text,
            image,
            clock,
            settings,
        }
    }

    pub async fn run_tick(&self, worker: Worker) -> TickReport {
        match worker {
            Worker::TextGeneration => self.text_generation_tick().await,
            Worker::ImageGeneration => self.image_generation_tick().await,
            Worker::ImageFetch => self.image_fetch_tick().await,
            Worker::StoryRequest => self.story_request_tick().await,
        }
    }

    /// Writes story text and summary for every `PendingTextGeneration` story.
    pub async fn text_generation_tick(&self) -> TickReport {
        let mut report = TickReport::default();

        for candidate in self.candidates(StoryStage::PendingTextGeneration, |_| true).await {
            let generated = self.generate_text(&candidate.story.prompt).await;
            let committed = match generated {
                Ok((story_text, summary)) => {
                    self.commit(&candidate, StoryStage::PendingTextGeneration, |story| {
                        story.advance(StoryStatus::PendingImageGeneration)?;
                        story.generated_story = story_text.clone();
                        story.generated_summary = summary.clone();
                        Ok(())
                    })
                    .await
                }
                Err(e) => Err(e),
            };
            record(&mut report, Worker::TextGeneration, &candidate, committed);
        }

        report
    }

    /// Requests an illustration for every `PendingImageGeneration` story.
    pub async fn image_generation_tick(&self) -> TickReport {
        let mut report = TickReport::default();

        for candidate in self.candidates(StoryStage::PendingImageGeneration, |_| true).await {
            let generated = self.bounded(self.image.generate(&candidate.story.prompt)).await;
            let committed = match generated {
                Ok(ImageGeneration::Ready { url }) => {
                    self.commit(&candidate, StoryStage::PendingImageGeneration, |story| {
                        story.advance(StoryStatus::StoryReady)?;
                        story.image_url = url.clone();
                        Ok(())
                    })
                    .await
                }
                Ok(ImageGeneration::Queued { job_id, eta }) => {
                    debug!(user_id = %candidate.user_id, story_id = candidate.story_id, %job_id, eta, "Image queued");
                    self.commit(&candidate, StoryStage::PendingImageGeneration, |story| {
                        story.advance(StoryStatus::PendingImageFetch(ImageJob {
                            id: job_id.clone(),
                            ready_at: eta,
                        }))?;
                        Ok(())
                    })
                    .await
                }
                Err(e) => Err(e),
            };
            record(&mut report, Worker::ImageGeneration, &candidate, committed);
        }

        report
    }

    /// Collects queued illustrations whose estimated ready time has passed.
    ///
    /// A job that is still processing leaves the story untouched, so it is
    /// simply polled again on the next tick.
    pub async fn image_fetch_tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let now = self.clock.now();

        let due = |story: &Story| {
            story
                .status
                .image_job()
                .is_some_and(|job| job.ready_at <= now)
        };

        for candidate in self.candidates(StoryStage::PendingImageFetch, due).await {
            let Some(job) = candidate.story.status.image_job() else {
                continue;
            };
            let fetched = self.bounded(self.image.fetch(&job.id)).await;
            let committed = match fetched {
                Ok(url) => {
                    let completed_at = self.clock.now();
                    self.commit(&candidate, StoryStage::PendingImageFetch, |story| {
                        story.advance(StoryStatus::StoryReady)?;
                        story.image_url = url.clone();
                        story.timestamp = completed_at;
                        Ok(())
                    })
                    .await
                }
                Err(e) => Err(e),
            };
            record(&mut report, Worker::ImageFetch, &candidate, committed);
        }

        report
    }

    /// Requests the next story, from the stored config, for every user whose
    /// latest story has been read.
    pub async fn story_request_tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let mut eligible = Vec::new();
        let mut users = self.store.stream_users();
        while let Some(item) = users.next().await {
            match item {
                Ok(stored) => {
                    if stored.user.latest_story().is_some_and(Story::is_ready_and_read) {
                        eligible.push(stored.user.user_id);
                    }
                }
                Err(e) => error!(error = %e, "Failed to read user while scanning for story requests"),
            }
        }
        drop(users);

        for user_id in eligible {
            let now = self.clock.now();
            match request_story(self.store.as_ref(), now, &user_id, &StoryRequest::default()).await {
                Ok(receipt) => {
                    info!(%user_id, story_id = receipt.story_id, "Scheduled next story");
                    report.advanced += 1;
                }
                Err(IntakeError::Quota(denial)) => {
                    debug!(%user_id, reason = denial.code(), "Next story not due yet");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(%user_id, error = %e, "Failed to schedule next story");
                    report.failed += 1;
                }
            }
        }

        report
    }

    //=====================================================================================
    // Helpers
    //=====================================================================================

    /// Reads every user afresh and returns the stories in `stage` matching `filter`,
    /// in storage order.
    async fn candidates<F>(&self, stage: StoryStage, filter: F) -> Vec<Candidate>
    where
        F: Fn(&Story) -> bool,
    {
        let mut found = Vec::new();
        let mut users = self.store.stream_users();

        while let Some(item) = users.next().await {
            let stored = match item {
                Ok(stored) => stored,
                Err(e) => {
                    error!(%stage, error = %e, "Failed to read user while scanning for stories");
                    continue;
                }
            };
            for (story_id, story) in stored.user.stories_in_stage(stage) {
                if filter(story) {
                    found.push(Candidate {
                        user_id: stored.user.user_id.clone(),
                        story_id,
                        story: story.clone(),
                    });
                }
            }
        }

        found
    }

    async fn generate_text(&self, prompt: &str) -> PortResult<(String, String)> {
        let settings = &self.settings;
        let story_text = self
            .bounded(self.text.complete(prompt, settings.story_temperature, settings.story_max_tokens))
            .await?;
        let story_text = story_text.trim().to_string();

        let summary = self
            .bounded(self.text.complete(
                &build_summary_prompt(&story_text),
                settings.summary_temperature,
                settings.summary_max_tokens,
            ))
            .await?;

        Ok((story_text, summary.trim().to_string()))
    }

    /// Runs a gateway call under the configured timeout.
    async fn bounded<T>(&self, call: impl Future<Output = PortResult<T>>) -> PortResult<T> {
        let limit = self.settings.gateway_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| PortError::Gateway(format!("Gateway call timed out after {:?}", limit)))?
    }

    /// Applies `update` to the candidate's story if it is still in `expected`.
    ///
    /// Returns `Ok(false)` when another writer already moved the story on.
    async fn commit<F>(&self, candidate: &Candidate, expected: StoryStage, update: F) -> PortResult<bool>
    where
        F: Fn(&mut Story) -> Result<(), TransitionError> + Send,
    {
        let story_id = candidate.story_id;
        let outcome = mutate_user(self.store.as_ref(), &candidate.user_id, move |user| {
            let Some(story) = user.stories.get_mut(story_id) else {
                return Ok(None);
            };
            if story.status.stage() != expected {
                return Ok(None);
            }
            update(story).map_err(|e| PortError::Unexpected(e.to_string()))?;
            Ok::<_, PortError>(Some(story.status.stage()))
        })
        .await?;

        Ok(outcome.is_some())
    }
}

fn record(report: &mut TickReport, worker: Worker, candidate: &Candidate, committed: PortResult<bool>) {
    match committed {
        Ok(true) => {
            info!(%worker, user_id = %candidate.user_id, story_id = candidate.story_id, "Story advanced");
            report.advanced += 1;
        }
        Ok(false) => {
            debug!(%worker, user_id = %candidate.user_id, story_id = candidate.story_id, "Story already moved on");
            report.skipped += 1;
        }
        Err(e) => {
            warn!(%worker, user_id = %candidate.user_id, story_id = candidate.story_id, error = %e, "Story left in place");
            report.failed += 1;
        }
    }
}
