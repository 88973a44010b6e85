//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use goodnight_core::clock::Clock;
use goodnight_core::ports::{IdentityVerifier, TextGenerationService, UserStore};
use std::sync::Arc;
use std::time::Duration;

//=========================================================================================
// AppState (Shared Across All Requests)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn UserStore>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub text_adapter: Arc<dyn TextGenerationService>,
    pub clock: Arc<dyn Clock>,
    /// Upper bound on text model calls made while a request waits.
    pub gateway_timeout: Duration,
}

/// The user id a request's bearer token was verified for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser(pub String);
