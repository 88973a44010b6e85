//! Tick-level behavior of the story lifecycle engine, driven against the
//! in-memory store and scripted generation gateways.

use async_trait::async_trait;
use goodnight_core::{
    GenerationSettings, ImageGeneration, ImageGenerationService, ImageJob, InMemoryUserStore,
    LifecycleEngine, ManualClock, PortError, PortResult, ReadStatus, StoredUser, Story,
    StoryStatus, TextGenerationService, TickReport, User, UserStore, UserStream, Worker,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const NOW: i64 = 1_700_000_000;

//=========================================================================================
// Scripted Gateways
//=========================================================================================

#[derive(Default)]
struct ScriptedText {
    calls: Mutex<Vec<String>>,
    /// Prompts containing this marker fail.
    fail_marker: Option<String>,
    delay: Option<Duration>,
}

#[async_trait]
impl TextGenerationService for ScriptedText {
    async fn complete(&self, prompt: &str, _temperature: f32, max_tokens: u32) -> PortResult<String> {
        self.calls.lock().unwrap().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_marker
            .as_deref()
            .is_some_and(|marker| prompt.contains(marker))
        {
            return Err(PortError::Gateway("completion failed".to_string()));
        }
        if prompt.starts_with("Give a short summary") {
            Ok(format!(" summary ({} tokens)\n", max_tokens))
        } else {
            Ok(format!("\n\nOnce upon a time: {}", prompt))
        }
    }
}

impl ScriptedText {
    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[derive(Default)]
struct ScriptedImage {
    generate: Mutex<HashMap<String, PortResult<ImageGeneration>>>,
    fetch: Mutex<HashMap<String, PortResult<String>>>,
    fetch_calls: Mutex<Vec<String>>,
}

impl ScriptedImage {
    fn on_generate(&self, prompt: &str, result: PortResult<ImageGeneration>) {
        self.generate.lock().unwrap().insert(prompt.to_string(), result);
    }

    fn on_fetch(&self, job_id: &str, result: PortResult<String>) {
        self.fetch.lock().unwrap().insert(job_id.to_string(), result);
    }
}

#[async_trait]
impl ImageGenerationService for ScriptedImage {
    async fn generate(&self, prompt: &str) -> PortResult<ImageGeneration> {
        self.generate
            .lock()
            .unwrap()
            .get(prompt)
            .cloned()
            .unwrap_or_else(|| Err(PortError::Gateway("unexpected body".to_string())))
    }

    async fn fetch(&self, job_id: &str) -> PortResult<String> {
        self.fetch_calls.lock().unwrap().push(job_id.to_string());
        self.fetch
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .unwrap_or_else(|| Err(PortError::Gateway("still processing".to_string())))
    }
}

//=========================================================================================
// Fixtures
//=========================================================================================

struct Harness {
    store: Arc<InMemoryUserStore>,
    text: Arc<ScriptedText>,
    image: Arc<ScriptedImage>,
    clock: Arc<ManualClock>,
    engine: LifecycleEngine,
}

fn harness_with(text: ScriptedText, settings: GenerationSettings) -> Harness {
    let store = Arc::new(InMemoryUserStore::new());
    let text = Arc::new(text);
    let image = Arc::new(ScriptedImage::default());
    let clock = Arc::new(ManualClock::new(NOW));
    let engine = LifecycleEngine::new(
        store.clone(),
        text.clone(),
        image.clone(),
        clock.clone(),
        settings,
    );
    Harness {
        store,
        text,
        image,
        clock,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedText::default(), GenerationSettings::default())
}

fn story(prompt: &str, status: StoryStatus) -> Story {
    let mut story = Story::new(prompt.to_string(), NOW - 600);
    story.status = status;
    story
}

async fn seed(store: &InMemoryUserStore, user_id: &str, stories: Vec<Story>) {
    let mut user = User::new(
        user_id.to_string(),
        "Reader".to_string(),
        format!("{}@example.com", user_id),
        String::new(),
    );
    user.stories = stories;
    assert!(store.create_user(user).await.unwrap());
}

async fn story_of(store: &InMemoryUserStore, user_id: &str, story_id: usize) -> Story {
    store.get_user(user_id).await.unwrap().unwrap().user.stories[story_id].clone()
}

//=========================================================================================
// Text Generation
//=========================================================================================

#[tokio::test]
async fn text_tick_writes_story_and_summary_together() {
    let h = harness();
    seed(&h.store, "u1", vec![story("Write a fable", StoryStatus::PendingTextGeneration)]).await;

    let report = h.engine.text_generation_tick().await;
    assert_eq!(report, TickReport { advanced: 1, failed: 0, skipped: 0 });

    let story = story_of(&h.store, "u1", 0).await;
    assert_eq!(story.status, StoryStatus::PendingImageGeneration);
    assert_eq!(story.generated_story, "Once upon a time: Write a fable");
    assert_eq!(story.generated_summary, "summary (25 tokens)");

    let calls = h.text.calls.lock().unwrap().clone();
    assert_eq!(calls[0], "Write a fable");
    assert!(calls[1].ends_with("this story: Once upon a time: Write a fable"));
}

#[tokio::test]
async fn text_tick_is_idempotent_once_advanced() {
    let h = harness();
    seed(&h.store, "u1", vec![story("Write a fable", StoryStatus::PendingTextGeneration)]).await;

    h.engine.text_generation_tick().await;
    assert_eq!(h.text.call_count(), 2);

    let report = h.engine.text_generation_tick().await;
    assert_eq!(report, TickReport::default());
    assert_eq!(h.text.call_count(), 2);
}

#[tokio::test]
async fn summary_failure_leaves_story_untouched() {
    let h = harness_with(
        ScriptedText {
            fail_marker: Some("Give a short summary".to_string()),
            ..Default::default()
        },
        GenerationSettings::default(),
    );
    seed(&h.store, "u1", vec![story("Write a fable", StoryStatus::PendingTextGeneration)]).await;

    let report = h.engine.text_generation_tick().await;
    assert_eq!(report.failed, 1);

    let story = story_of(&h.store, "u1", 0).await;
    assert_eq!(story.status, StoryStatus::PendingTextGeneration);
    assert!(story.generated_story.is_empty());
    assert!(story.generated_summary.is_empty());
}

#[tokio::test]
async fn failure_for_one_user_does_not_block_another() {
    let h = harness_with(
        ScriptedText {
            fail_marker: Some("doomed".to_string()),
            ..Default::default()
        },
        GenerationSettings::default(),
    );
    seed(&h.store, "a", vec![story("doomed tale", StoryStatus::PendingTextGeneration)]).await;
    seed(&h.store, "b", vec![story("happy tale", StoryStatus::PendingTextGeneration)]).await;

    let report = h.engine.text_generation_tick().await;
    assert_eq!(report, TickReport { advanced: 1, failed: 1, skipped: 0 });

    assert_eq!(story_of(&h.store, "a", 0).await.status, StoryStatus::PendingTextGeneration);
    assert_eq!(story_of(&h.store, "b", 0).await.status, StoryStatus::PendingImageGeneration);
}

#[tokio::test]
async fn slow_gateway_times_out_and_is_retried_later() {
    let h = harness_with(
        ScriptedText {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        },
        GenerationSettings {
            gateway_timeout: Duration::from_millis(20),
            ..Default::default()
        },
    );
    seed(&h.store, "u1", vec![story("Write a fable", StoryStatus::PendingTextGeneration)]).await;

    let report = h.engine.text_generation_tick().await;
    assert_eq!(report.failed, 1);
    assert_eq!(story_of(&h.store, "u1", 0).await.status, StoryStatus::PendingTextGeneration);
}

//=========================================================================================
// Image Generation
//=========================================================================================

#[tokio::test]
async fn queued_image_moves_story_to_fetch() {
    let h = harness();
    seed(&h.store, "u1", vec![story("Draw me", StoryStatus::PendingImageGeneration)]).await;
    h.image.on_generate(
        "Draw me",
        Ok(ImageGeneration::Queued {
            job_id: "abc".to_string(),
            eta: NOW + 120,
        }),
    );

    let report = h.engine.image_generation_tick().await;
    assert_eq!(report.advanced, 1);

    let story = story_of(&h.store, "u1", 0).await;
    assert_eq!(
        story.status,
        StoryStatus::PendingImageFetch(ImageJob {
            id: "abc".to_string(),
            ready_at: NOW + 120,
        })
    );
    assert!(story.image_url.is_empty());
}

#[tokio::test]
async fn immediate_image_finishes_story() {
    let h = harness();
    seed(&h.store, "u1", vec![story("Draw me", StoryStatus::PendingImageGeneration)]).await;
    h.image.on_generate(
        "Draw me",
        Ok(ImageGeneration::Ready {
            url: "https://img.example/1.png".to_string(),
        }),
    );

    h.engine.image_generation_tick().await;

    let story = story_of(&h.store, "u1", 0).await;
    assert_eq!(story.status, StoryStatus::StoryReady);
    assert_eq!(story.image_url, "https://img.example/1.png");
    assert_eq!(story.read_status, ReadStatus::Unread);
}

#[tokio::test]
async fn malformed_image_response_keeps_story_for_retry() {
    let h = harness();
    seed(&h.store, "u1", vec![story("Draw me", StoryStatus::PendingImageGeneration)]).await;

    let report = h.engine.image_generation_tick().await;
    assert_eq!(report.failed, 1);
    assert_eq!(story_of(&h.store, "u1", 0).await.status, StoryStatus::PendingImageGeneration);

    h.image.on_generate(
        "Draw me",
        Ok(ImageGeneration::Ready {
            url: "https://img.example/2.png".to_string(),
        }),
    );
    let report = h.engine.image_generation_tick().await;
    assert_eq!(report.advanced, 1);
}

//=========================================================================================
// Image Fetch
//=========================================================================================

fn queued(prompt: &str, job_id: &str, ready_at: i64) -> Story {
    story(
        prompt,
        StoryStatus::PendingImageFetch(ImageJob {
            id: job_id.to_string(),
            ready_at,
        }),
    )
}

#[tokio::test]
async fn due_job_is_fetched_and_timestamp_refreshed() {
    let h = harness();
    seed(&h.store, "u1", vec![queued("Draw me", "job-1", NOW - 5)]).await;
    h.image.on_fetch("job-1", Ok("https://img.example/job-1.png".to_string()));

    let report = h.engine.image_fetch_tick().await;
    assert_eq!(report.advanced, 1);

    let story = story_of(&h.store, "u1", 0).await;
    assert_eq!(story.status, StoryStatus::StoryReady);
    assert_eq!(story.image_url, "https://img.example/job-1.png");
    assert_eq!(story.timestamp, NOW);
}

#[tokio::test]
async fn job_not_yet_due_is_skipped() {
    let h = harness();
    seed(&h.store, "u1", vec![queued("Draw me", "job-1", NOW + 5)]).await;
    h.image.on_fetch("job-1", Ok("https://img.example/job-1.png".to_string()));

    let report = h.engine.image_fetch_tick().await;
    assert_eq!(report, TickReport::default());
    assert!(h.image.fetch_calls.lock().unwrap().is_empty());

    h.clock.advance(10);
    let report = h.engine.image_fetch_tick().await;
    assert_eq!(report.advanced, 1);
}

#[tokio::test]
async fn still_processing_job_is_polled_again_without_moving_eta() {
    let h = harness();
    seed(&h.store, "u1", vec![queued("Draw me", "job-1", NOW - 5)]).await;

    let report = h.engine.image_fetch_tick().await;
    assert_eq!(report.failed, 1);

    let story = story_of(&h.store, "u1", 0).await;
    assert_eq!(story.status.image_job().unwrap().ready_at, NOW - 5);

    h.engine.image_fetch_tick().await;
    assert_eq!(h.image.fetch_calls.lock().unwrap().len(), 2);
}

//=========================================================================================
// Full Lifecycle and Story Requests
//=========================================================================================

#[tokio::test]
async fn story_walks_every_stage_in_order() {
    let h = harness();
    seed(&h.store, "u1", vec![story("Write a fable", StoryStatus::PendingTextGeneration)]).await;
    h.image.on_generate(
        "Write a fable",
        Ok(ImageGeneration::Queued {
            job_id: "j".to_string(),
            eta: NOW + 30,
        }),
    );
    h.image.on_fetch("j", Ok("https://img.example/j.png".to_string()));

    // Later stages see nothing until earlier ones have run.
    assert_eq!(h.engine.run_tick(Worker::ImageFetch).await, TickReport::default());
    assert_eq!(h.engine.run_tick(Worker::ImageGeneration).await, TickReport::default());

    for worker in [Worker::TextGeneration, Worker::ImageGeneration] {
        assert_eq!(h.engine.run_tick(worker).await.advanced, 1, "{}", worker);
    }
    h.clock.advance(30);
    assert_eq!(h.engine.run_tick(Worker::ImageFetch).await.advanced, 1);

    assert!(story_of(&h.store, "u1", 0).await.is_ready());
}

#[tokio::test]
async fn story_request_tick_schedules_next_story_for_readers() {
    let h = harness();
    let mut finished = story("Write a fable", StoryStatus::StoryReady);
    finished.read_status = ReadStatus::Read;
    seed(&h.store, "reader", vec![finished.clone()]).await;
    seed(&h.store, "unread", vec![story("Write a myth", StoryStatus::StoryReady)]).await;
    seed(&h.store, "newcomer", vec![]).await;

    let report = h.engine.story_request_tick().await;
    assert_eq!(report.advanced, 1);

    let reader = h.store.get_user("reader").await.unwrap().unwrap().user;
    assert_eq!(reader.stories.len(), 2);
    assert_eq!(reader.stories[1].status, StoryStatus::PendingTextGeneration);
    assert_eq!(reader.last_story_generated_timestamp, NOW);

    let unread = h.store.get_user("unread").await.unwrap().unwrap().user;
    assert_eq!(unread.stories.len(), 1);
    let newcomer = h.store.get_user("newcomer").await.unwrap().unwrap().user;
    assert!(newcomer.stories.is_empty());

    // The new story is in flight, so a second tick schedules nothing.
    assert_eq!(h.engine.story_request_tick().await, TickReport::default());
}

//=========================================================================================
// Store Failures
//=========================================================================================

/// Prepends one unreadable record to every user scan.
struct CorruptRecordStore {
    inner: InMemoryUserStore,
}

#[async_trait]
impl UserStore for CorruptRecordStore {
    async fn get_user(&self, user_id: &str) -> PortResult<Option<StoredUser>> {
        self.inner.get_user(user_id).await
    }

    async fn create_user(&self, user: User) -> PortResult<bool> {
        self.inner.create_user(user).await
    }

    async fn replace_user(&self, user: &User, expected_revision: i64) -> PortResult<i64> {
        self.inner.replace_user(user, expected_revision).await
    }

    fn stream_users(&self) -> UserStream<'_> {
        let corrupt = futures::stream::once(async {
            Err::<StoredUser, _>(PortError::Unexpected("bad document".to_string()))
        });
        Box::pin(futures::StreamExt::chain(corrupt, self.inner.stream_users()))
    }
}

#[tokio::test]
async fn unreadable_user_does_not_stop_the_scan() {
    let store = Arc::new(CorruptRecordStore {
        inner: InMemoryUserStore::new(),
    });
    seed(&store.inner, "u1", vec![story("Write a fable", StoryStatus::PendingTextGeneration)]).await;

    let engine = LifecycleEngine::new(
        store.clone(),
        Arc::new(ScriptedText::default()),
        Arc::new(ScriptedImage::default()),
        Arc::new(ManualClock::new(NOW)),
        GenerationSettings::default(),
    );

    let report = engine.text_generation_tick().await;
    assert_eq!(report.advanced, 1);
}
