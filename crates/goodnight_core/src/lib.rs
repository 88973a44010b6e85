pub mod clock;
pub mod domain;
pub mod intake;
pub mod lifecycle;
pub mod memory;
pub mod ports;
pub mod prompts;
pub mod quota;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::{
    AgeGroup, ImageJob, ReadStatus, Story, StoryId, StoryStage, StoryStatus, Subscription, User,
    UserConfig,
};
pub use intake::{request_story, IntakeError, StoryReceipt, StoryRequest};
pub use lifecycle::{GenerationSettings, LifecycleEngine, TickReport, Worker};
pub use memory::InMemoryUserStore;
pub use ports::{
    IdentityVerifier, ImageGeneration, ImageGenerationService, PortError, PortResult, StoredUser,
    TextGenerationService, UserStore, UserStream,
};
pub use quota::{check_quota, QuotaDenial, QuotaGrant};
pub use store::mutate_user;
