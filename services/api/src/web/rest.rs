//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::state::{AppState, VerifiedUser};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use goodnight_core::{
    domain::{AgeGroup, ReadStatus, Story, StoryId, User, UserConfig},
    intake::{request_story, IntakeError, StoryRequest, MAX_FIELD_LEN},
    ports::PortError,
    prompts::build_prompt,
    quota::QuotaDenial,
    store::mutate_user,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        create_user_handler,
        get_user_handler,
        update_config_handler,
        update_subscription_handler,
        create_story_handler,
        mark_story_read_handler,
        latest_story_handler,
        list_stories_handler,
        prompt_handler,
    ),
    components(
        schemas(
            HealthResponse, CreateUserRequest, CreateUserResponse, UserConfigPayload,
            SubscriptionPayload, SubscriptionView, UserView, StoryView, NewStoryRequest,
            NewStoryResponse, PromptRequest, PromptResponse
        )
    ),
    tags(
        (name = "Goodnight Stories API", description = "Accounts and personalized illustrated stories.")
    )
)]
pub struct ApiDoc;

type HandlerResult<T> = Result<T, (StatusCode, String)>;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
}

#[derive(Deserialize, Serialize, ToSchema, Clone, Debug, Default)]
pub struct UserConfigPayload {
    pub genre: String,
    #[serde(default)]
    pub main_character_name: Option<String>,
    /// One of `children`, `teens`, `adults`.
    #[serde(default)]
    pub age_group: Option<String>,
}

impl UserConfigPayload {
    fn into_domain(self) -> Result<UserConfig, (StatusCode, String)> {
        let genre = self.genre.trim().to_string();
        if genre.is_empty() || genre.chars().count() > MAX_FIELD_LEN {
            return Err(bad_request(format!(
                "genre must be between 1 and {} characters",
                MAX_FIELD_LEN
            )));
        }
        let main_character_name = self
            .main_character_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        if main_character_name
            .as_ref()
            .is_some_and(|name| name.chars().count() > MAX_FIELD_LEN)
        {
            return Err(bad_request(format!(
                "main_character_name must be at most {} characters",
                MAX_FIELD_LEN
            )));
        }
        let age_group = match self.age_group {
            Some(raw) => raw.parse::<AgeGroup>().map_err(bad_request)?,
            None => AgeGroup::default(),
        };
        Ok(UserConfig {
            genre,
            main_character_name,
            age_group,
        })
    }

    fn from_domain(config: &UserConfig) -> Self {
        Self {
            genre: config.genre.clone(),
            main_character_name: config.main_character_name.clone(),
            age_group: Some(config.age_group.as_str().to_string()),
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub profile_picture: String,
    #[serde(default)]
    pub user_config: Option<UserConfigPayload>,
}

#[derive(Serialize, ToSchema)]
pub struct CreateUserResponse {
    message: String,
    user_id: String,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct SubscriptionPayload {
    pub start_date_timestamp: i64,
    pub end_date_timestamp: i64,
}

#[derive(Serialize, ToSchema)]
pub struct SubscriptionView {
    start_date_timestamp: i64,
    end_date_timestamp: i64,
    finished_free_story: bool,
}

/// A story as returned to clients. `story_id` is its position in the user's list.
#[derive(Serialize, ToSchema)]
pub struct StoryView {
    story_id: StoryId,
    prompt: String,
    generated_story: String,
    generated_summary: String,
    image_url: String,
    timestamp: i64,
    read_status: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fetch_image_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fetch_image_id: Option<String>,
}

impl StoryView {
    fn new(story_id: StoryId, story: &Story) -> Self {
        let job = story.status.image_job();
        Self {
            story_id,
            prompt: story.prompt.clone(),
            generated_story: story.generated_story.clone(),
            generated_summary: story.generated_summary.clone(),
            image_url: story.image_url.clone(),
            timestamp: story.timestamp,
            read_status: story.read_status.as_str().to_string(),
            status: story.status.stage().as_str().to_string(),
            fetch_image_timestamp: job.map(|job| job.ready_at),
            fetch_image_id: job.map(|job| job.id.clone()),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct UserView {
    user_id: String,
    name: String,
    email: String,
    profile_picture: String,
    last_story_generated_timestamp: i64,
    subscription: SubscriptionView,
    config: UserConfigPayload,
    stories: Vec<StoryView>,
}

impl UserView {
    fn new(user: &User) -> Self {
        Self {
            user_id: user.user_id.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            profile_picture: user.profile_picture.clone(),
            last_story_generated_timestamp: user.last_story_generated_timestamp,
            subscription: SubscriptionView {
                start_date_timestamp: user.subscription.start_date_timestamp,
                end_date_timestamp: user.subscription.end_date_timestamp,
                finished_free_story: user.subscription.finished_free_story,
            },
            config: UserConfigPayload::from_domain(&user.config),
            stories: story_views(user),
        }
    }
}

fn story_views(user: &User) -> Vec<StoryView> {
    user.stories
        .iter()
        .enumerate()
        .map(|(id, story)| StoryView::new(id, story))
        .collect()
}

#[derive(Deserialize, ToSchema, Default)]
pub struct NewStoryRequest {
    /// If present, must match the user the bearer token was issued to.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub main_character_name: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct NewStoryResponse {
    message: String,
    story_id: StoryId,
}

#[derive(Deserialize, ToSchema)]
pub struct PromptRequest {
    pub genre: String,
    #[serde(default)]
    pub main_character_name: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.9
}

fn default_max_tokens() -> u32 {
    400
}

const MAX_PROMPT_TOKENS: u32 = 1000;

#[derive(Serialize, ToSchema)]
pub struct PromptResponse {
    prompt: String,
    text: String,
}

//=========================================================================================
// Error Mapping
//=========================================================================================

fn bad_request(message: impl ToString) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.to_string())
}

fn port_rejection(action: &str, e: PortError) -> (StatusCode, String) {
    match e {
        PortError::NotFound(message) => (StatusCode::NOT_FOUND, message),
        PortError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
        other => {
            error!("Failed to {}: {:?}", action, other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to {}", action),
            )
        }
    }
}

fn intake_rejection(e: IntakeError) -> (StatusCode, String) {
    match e {
        IntakeError::Quota(denial) => {
            let status = match denial {
                QuotaDenial::NotReady => StatusCode::CONFLICT,
                QuotaDenial::TooFrequent => StatusCode::TOO_MANY_REQUESTS,
                QuotaDenial::TierExhausted => StatusCode::FORBIDDEN,
            };
            (status, format!("{}: {}", denial.code(), denial))
        }
        IntakeError::NotFound(message) => (StatusCode::NOT_FOUND, message),
        IntakeError::Validation(message) => (StatusCode::BAD_REQUEST, message),
        IntakeError::Port(e) => port_rejection("create story", e),
    }
}

/// Errors raised inside a user mutation by the handlers below.
enum EditError {
    Port(PortError),
    Rejected(StatusCode, String),
}

impl From<PortError> for EditError {
    fn from(e: PortError) -> Self {
        EditError::Port(e)
    }
}

fn edit_rejection(action: &str, e: EditError) -> (StatusCode, String) {
    match e {
        EditError::Port(e) => port_rejection(action, e),
        EditError::Rejected(status, message) => (status, message),
    }
}

async fn load_user(app_state: &AppState, user_id: &str) -> HandlerResult<User> {
    app_state
        .store
        .get_user(user_id)
        .await
        .map_err(|e| port_rejection("load user", e))?
        .map(|stored| stored.user)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "User does not exist".to_string()))
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "active".to_string(),
    })
}

/// Register the calling user. Calling it again for the same user is a no-op.
#[utoipa::path(
    post,
    path = "/user",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User created", body = CreateUserResponse),
        (status = 200, description = "User already exists", body = CreateUserResponse),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Missing or invalid bearer token")
    )
)]
pub async fn create_user_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(VerifiedUser(user_id)): Extension<VerifiedUser>,
    Json(req): Json<CreateUserRequest>,
) -> HandlerResult<impl IntoResponse> {
    let config = req
        .user_config
        .map(UserConfigPayload::into_domain)
        .transpose()?
        .unwrap_or_default();

    let mut user = User::new(user_id.clone(), req.name, req.email, req.profile_picture);
    user.config = config;

    let created = app_state
        .store
        .create_user(user)
        .await
        .map_err(|e| port_rejection("create user", e))?;

    if created {
        info!(%user_id, "User registered");
        Ok((
            StatusCode::CREATED,
            Json(CreateUserResponse {
                message: "User information stored successfully".to_string(),
                user_id,
            }),
        ))
    } else {
        Ok((
            StatusCode::OK,
            Json(CreateUserResponse {
                message: "User already exists".to_string(),
                user_id,
            }),
        ))
    }
}

/// Fetch the calling user, stories included.
#[utoipa::path(
    get,
    path = "/user",
    responses(
        (status = 200, description = "The user", body = UserView),
        (status = 404, description = "User does not exist")
    )
)]
pub async fn get_user_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(VerifiedUser(user_id)): Extension<VerifiedUser>,
) -> HandlerResult<Json<UserView>> {
    let user = load_user(&app_state, &user_id).await?;
    Ok(Json(UserView::new(&user)))
}

/// Replace the calling user's story preferences.
#[utoipa::path(
    put,
    path = "/user/config",
    request_body = UserConfigPayload,
    responses(
        (status = 200, description = "Config updated", body = UserConfigPayload),
        (status = 400, description = "Invalid config"),
        (status = 404, description = "User does not exist")
    )
)]
pub async fn update_config_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(VerifiedUser(user_id)): Extension<VerifiedUser>,
    Json(req): Json<UserConfigPayload>,
) -> HandlerResult<Json<UserConfigPayload>> {
    let config = req.into_domain()?;

    mutate_user(app_state.store.as_ref(), &user_id, |user| {
        user.config = config.clone();
        Ok::<_, PortError>(Some(()))
    })
    .await
    .map_err(|e| port_rejection("update config", e))?;

    Ok(Json(UserConfigPayload::from_domain(&config)))
}

/// Record a new paid period for the calling user.
#[utoipa::path(
    put,
    path = "/user/subscription",
    request_body = SubscriptionPayload,
    responses(
        (status = 200, description = "Subscription updated", body = SubscriptionView),
        (status = 400, description = "End date before start date"),
        (status = 404, description = "User does not exist")
    )
)]
pub async fn update_subscription_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(VerifiedUser(user_id)): Extension<VerifiedUser>,
    Json(req): Json<SubscriptionPayload>,
) -> HandlerResult<Json<SubscriptionView>> {
    if req.end_date_timestamp < req.start_date_timestamp {
        return Err(bad_request("end_date_timestamp must not be before start_date_timestamp"));
    }

    let subscription = mutate_user(app_state.store.as_ref(), &user_id, |user| {
        user.subscription.start_date_timestamp = req.start_date_timestamp;
        user.subscription.end_date_timestamp = req.end_date_timestamp;
        Ok::<_, PortError>(Some(user.subscription.clone()))
    })
    .await
    .map_err(|e| port_rejection("update subscription", e))?
    .ok_or_else(|| (StatusCode::INTERNAL_SERVER_ERROR, "Failed to update subscription".to_string()))?;

    Ok(Json(SubscriptionView {
        start_date_timestamp: subscription.start_date_timestamp,
        end_date_timestamp: subscription.end_date_timestamp,
        finished_free_story: subscription.finished_free_story,
    }))
}

/// Request a new story. Fields left out fall back to the stored config.
#[utoipa::path(
    post,
    path = "/story",
    request_body = NewStoryRequest,
    responses(
        (status = 202, description = "Story queued for generation", body = NewStoryResponse),
        (status = 400, description = "Invalid request"),
        (status = 403, description = "Free tier ran out, or user_id does not match the token"),
        (status = 404, description = "User does not exist"),
        (status = 409, description = "The previous story is not ready and read yet"),
        (status = 429, description = "A story was already requested in the last 24 hours")
    )
)]
pub async fn create_story_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(VerifiedUser(user_id)): Extension<VerifiedUser>,
    Json(req): Json<NewStoryRequest>,
) -> HandlerResult<impl IntoResponse> {
    if req.user_id.as_deref().is_some_and(|claimed| claimed != user_id) {
        return Err((
            StatusCode::FORBIDDEN,
            "user_id does not match the authenticated user".to_string(),
        ));
    }

    let request = StoryRequest {
        genre: req.genre,
        main_character_name: req.main_character_name,
    };
    let now = app_state.clock.now();
    let receipt = request_story(app_state.store.as_ref(), now, &user_id, &request)
        .await
        .map_err(intake_rejection)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(NewStoryResponse {
            message: "Story request created successfully".to_string(),
            story_id: receipt.story_id,
        }),
    ))
}

/// Mark a finished story as read.
#[utoipa::path(
    post,
    path = "/story/{story_id}/read",
    params(("story_id" = usize, Path, description = "Position of the story in the user's list.")),
    responses(
        (status = 200, description = "Story marked as read", body = StoryView),
        (status = 404, description = "User or story does not exist"),
        (status = 409, description = "Story is not ready yet")
    )
)]
pub async fn mark_story_read_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(VerifiedUser(user_id)): Extension<VerifiedUser>,
    Path(story_id): Path<StoryId>,
) -> HandlerResult<Json<StoryView>> {
    let story = mutate_user(app_state.store.as_ref(), &user_id, |user| -> Result<Option<Story>, EditError> {
        let story = user.stories.get_mut(story_id).ok_or_else(|| {
            EditError::Rejected(StatusCode::NOT_FOUND, format!("Story {} not found", story_id))
        })?;
        if !story.is_ready() {
            return Err(EditError::Rejected(
                StatusCode::CONFLICT,
                format!("Story {} is not ready yet", story_id),
            ));
        }
        if story.read_status == ReadStatus::Read {
            return Ok(None);
        }
        story.read_status = ReadStatus::Read;
        Ok(Some(story.clone()))
    })
    .await
    .map_err(|e| edit_rejection("mark story read", e))?;

    let story = match story {
        Some(story) => story,
        // Already read; report the stored state.
        None => load_user(&app_state, &user_id)
            .await?
            .stories
            .get(story_id)
            .cloned()
            .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Story {} not found", story_id)))?,
    };

    Ok(Json(StoryView::new(story_id, &story)))
}

/// Fetch the newest story whose illustration is done.
#[utoipa::path(
    get,
    path = "/story/latest",
    responses(
        (status = 200, description = "The latest ready story", body = StoryView),
        (status = 404, description = "No story is ready yet")
    )
)]
pub async fn latest_story_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(VerifiedUser(user_id)): Extension<VerifiedUser>,
) -> HandlerResult<Json<StoryView>> {
    let user = load_user(&app_state, &user_id).await?;
    let (story_id, story) = user
        .latest_ready_story()
        .ok_or_else(|| (StatusCode::NOT_FOUND, "No story is ready yet".to_string()))?;
    Ok(Json(StoryView::new(story_id, story)))
}

/// List every story of the calling user, oldest first.
#[utoipa::path(
    get,
    path = "/stories",
    responses(
        (status = 200, description = "All stories", body = [StoryView]),
        (status = 404, description = "User does not exist")
    )
)]
pub async fn list_stories_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(VerifiedUser(user_id)): Extension<VerifiedUser>,
) -> HandlerResult<Json<Vec<StoryView>>> {
    let user = load_user(&app_state, &user_id).await?;
    Ok(Json(story_views(&user)))
}

/// Try a story prompt directly against the text model.
#[utoipa::path(
    post,
    path = "/prompt",
    request_body = PromptRequest,
    responses(
        (status = 200, description = "Generated text", body = PromptResponse),
        (status = 400, description = "Invalid request"),
        (status = 502, description = "Text model failed"),
        (status = 504, description = "Text model timed out")
    )
)]
pub async fn prompt_handler(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<PromptRequest>,
) -> HandlerResult<Json<PromptResponse>> {
    if req.genre.trim().is_empty() || req.genre.chars().count() > MAX_FIELD_LEN {
        return Err(bad_request(format!(
            "genre must be between 1 and {} characters",
            MAX_FIELD_LEN
        )));
    }
    if !(0.0..=2.0).contains(&req.temperature) {
        return Err(bad_request("temperature must be between 0 and 2"));
    }
    if req.max_tokens == 0 || req.max_tokens > MAX_PROMPT_TOKENS {
        return Err(bad_request(format!(
            "max_tokens must be between 1 and {}",
            MAX_PROMPT_TOKENS
        )));
    }

    let prompt = build_prompt(&req.genre, req.main_character_name.as_deref(), None);
    let completion = app_state
        .text_adapter
        .complete(&prompt, req.temperature, req.max_tokens);
    let text = tokio::time::timeout(app_state.gateway_timeout, completion)
        .await
        .map_err(|_| {
            error!("Text model did not answer within {:?}", app_state.gateway_timeout);
            (
                StatusCode::GATEWAY_TIMEOUT,
                "Text model did not answer in time".to_string(),
            )
        })?
        .map_err(|e| match e {
            PortError::Gateway(message) => (StatusCode::BAD_GATEWAY, message),
            other => port_rejection("generate text", other),
        })?;

    Ok(Json(PromptResponse { prompt, text }))
}
