//! services/api/src/adapters/text_llm.rs
//!
//! This module contains the adapter for the story-writing LLM.
//! It implements the `TextGenerationService` port from the `core` crate.

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client, error::OpenAIError,
};
use async_trait::async_trait;
use goodnight_core::ports::{PortError, PortResult, TextGenerationService};

const SYSTEM_INSTRUCTIONS: &str = "You are a storyteller writing short, self-contained stories. \
Follow the request exactly and answer with the requested text only, without titles, notes or commentary.";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `TextGenerationService` using an OpenAI-compatible chat model.
#[derive(Clone)]
pub struct OpenAiTextAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiTextAdapter {
    /// Creates a new `OpenAiTextAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }
}

fn gateway(e: impl ToString) -> PortError {
    PortError::Gateway(e.to_string())
}

//=========================================================================================
// `TextGenerationService` Trait Implementation
//=========================================================================================

#[async_trait]
impl TextGenerationService for OpenAiTextAdapter {
    async fn complete(&self, prompt: &str, temperature: f32, max_tokens: u32) -> PortResult<String> {
        let messages = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(SYSTEM_INSTRUCTIONS)
                .build()
                .map_err(gateway)?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(gateway)?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(temperature)
            .max_tokens(max_tokens)
            .n(1)
            .build()
            .map_err(gateway)?;

        // Call the API and manually map the error if it occurs, which respects the orphan rule.
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e: OpenAIError| gateway(e))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| gateway("Text LLM returned no choices in its response."))?
            .message
            .content
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| gateway("Text LLM response contained no text content."))?;

        Ok(content)
    }
}
