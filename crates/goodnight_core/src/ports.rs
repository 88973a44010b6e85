//! crates/goodnight_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use crate::domain::User;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    /// A write lost a race against another writer of the same document.
    #[error("Write conflict: {0}")]
    Conflict(String),
    /// An external generation service failed, timed out, or answered with an unusable body.
    #[error("Gateway error: {0}")]
    Gateway(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Store Types
//=========================================================================================

/// A user document together with the revision it was read at.
#[derive(Debug, Clone)]
pub struct StoredUser {
    pub revision: i64,
    pub user: User,
}

pub type UserStream<'a> = Pin<Box<dyn Stream<Item = PortResult<StoredUser>> + Send + 'a>>;

//=========================================================================================
// Gateway Types
//=========================================================================================

/// What the image gateway answered to a generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageGeneration {
    /// The illustration is already available.
    Ready { url: String },
    /// The job was queued; `eta` is the epoch second it should be fetchable at.
    Queued { job_id: String, eta: i64 },
}

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, user_id: &str) -> PortResult<Option<StoredUser>>;

    /// Inserts a new user. Returns `false` without touching anything if the id is taken.
    async fn create_user(&self, user: User) -> PortResult<bool>;

    /// Replaces the whole user document if it is still at `expected_revision`.
    ///
    /// Fails with `PortError::Conflict` otherwise. Returns the new revision.
    async fn replace_user(&self, user: &User, expected_revision: i64) -> PortResult<i64>;

    /// Streams every user in a stable order.
    fn stream_users(&self) -> UserStream<'_>;
}

#[async_trait]
pub trait TextGenerationService: Send + Sync {
    /// Completes a prompt into free text.
    async fn complete(&self, prompt: &str, temperature: f32, max_tokens: u32) -> PortResult<String>;
}

#[async_trait]
pub trait ImageGenerationService: Send + Sync {
    /// Requests an illustration for a prompt.
    async fn generate(&self, prompt: &str) -> PortResult<ImageGeneration>;

    /// Retrieves the result of a queued job.
    async fn fetch(&self, job_id: &str) -> PortResult<String>;
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verifies a bearer token and returns the subject (user id) it was issued to.
    async fn verify(&self, token: &str) -> PortResult<String>;
}
