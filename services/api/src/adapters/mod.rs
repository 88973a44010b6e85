pub mod db;
pub mod identity;
pub mod image_gen;
pub mod text_llm;

pub use db::DbAdapter;
pub use identity::JwtIdentityVerifier;
pub use image_gen::StableDiffusionAdapter;
pub use text_llm::OpenAiTextAdapter;
