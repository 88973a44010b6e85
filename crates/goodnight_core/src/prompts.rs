//! Prompt templates fed to the text generator.

use crate::domain::AgeGroup;

/// Builds the prompt a new story is generated from.
pub fn build_prompt(genre: &str, main_character: Option<&str>, age_group: Option<AgeGroup>) -> String {
    let mut prompt = format!("Write a {} short story", genre.trim());

    if let Some(name) = main_character.map(str::trim).filter(|name| !name.is_empty()) {
        prompt.push_str(" featuring ");
        prompt.push_str(name);
    }

    if let Some(age_group) = age_group {
        prompt.push_str(match age_group {
            AgeGroup::Children => " for children",
            AgeGroup::Teens => " for teenagers",
            AgeGroup::Adults => " for adults",
        });
    }

    prompt.push_str(" with a starting and ending.");
    prompt
}

/// Builds the prompt that turns a finished story into an illustration brief.
pub fn build_summary_prompt(story_text: &str) -> String {
    format!(
        "Give a short summary to generate a prompt for an illustration for this story: {}",
        story_text
    )
}
