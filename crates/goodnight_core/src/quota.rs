//! crates/goodnight_core/src/quota.rs
//!
//! Decides whether a user may request a new story.

use crate::domain::{Story, Subscription, SECONDS_PER_DAY};

/// Minimum time between two accepted story requests of the same user.
pub const STORY_COOLDOWN_SECS: i64 = SECONDS_PER_DAY;

/// Why a story request was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QuotaDenial {
    #[error("the previous story is not ready and read yet")]
    NotReady,
    #[error("a story was already requested in the last 24 hours")]
    TooFrequent,
    #[error("the free story after the subscription ended has already been used")]
    TierExhausted,
}

impl QuotaDenial {
    pub fn code(&self) -> &'static str {
        match self {
            QuotaDenial::NotReady => "quota_not_ready",
            QuotaDenial::TooFrequent => "too_frequent",
            QuotaDenial::TierExhausted => "tier_exhausted",
        }
    }
}

/// Permission to create a story, with the side effects accepting it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaGrant {
    /// The request uses up the single free story granted after expiry.
    pub consumes_free_story: bool,
}

impl QuotaGrant {
    pub fn apply(&self, subscription: &mut Subscription) {
        if self.consumes_free_story {
            subscription.finished_free_story = true;
        }
    }
}

/// Evaluates the quota rules in their fixed order: unread story, cooldown, tier.
pub fn check_quota(
    now: i64,
    subscription: &Subscription,
    last_story_generated_timestamp: i64,
    latest_story: Option<&Story>,
) -> Result<QuotaGrant, QuotaDenial> {
    if latest_story.is_some_and(|story| !story.is_ready_and_read()) {
        return Err(QuotaDenial::NotReady);
    }

    if now - last_story_generated_timestamp < STORY_COOLDOWN_SECS {
        return Err(QuotaDenial::TooFrequent);
    }

    let expired = subscription.is_expired(now);
    if expired && subscription.finished_free_story {
        return Err(QuotaDenial::TierExhausted);
    }

    Ok(QuotaGrant {
        consumes_free_story: expired,
    })
}
