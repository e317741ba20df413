use std::sync::OnceLock;

use anyhow::{bail, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const START_STORY: &str = "We are about to embark on an interactive story. \
At each step, we will ask the user to make a choice that will shape the story. \
Please provide the first type of choice the user should make (e.g., hero, villain, place, etc.), \
and then provide 5 creative options for that choice.";

pub const START_STORY_REALTIME: &str = "We are about to embark on an interactive story. \
At each step, you will make choices that shape the story. \
Let's begin!";

pub const CONVERSATION_OPENER: &str = "Let's start an interactive story. \
You'll ask the user questions to help shape the story. \
Begin by asking an open-ended question to start the story.";

const CHOICE_FORMAT: &str = "Respond only with JSON of the form \
{\"choice_type\": \"<type of choice>\", \"choices\": [\"<option>\", \"<option>\", \"<option>\", \"<option>\", \"<option>\"]}.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceSet {
    #[serde(alias = "type")]
    pub choice_type: String,
    #[serde(alias = "options")]
    pub choices: Vec<String>,
}

/// Appends the answer format every choice prompt asks for.
pub fn with_choice_format(prompt: &str) -> String {
    format!("{}\n\n{}", prompt, CHOICE_FORMAT)
}

pub fn next_choice_type(context: &str, user_choice: &str) -> String {
    format!(
        "Based on the following context:\n{}\nThe user chose '{}'. \
         What type of choice should the user make next (e.g., hero, villain, place, etc.)? \
         Provide 5 options for it.",
        context, user_choice
    )
}

pub fn continuation(context: &str, user_choice: &str) -> String {
    format!("{}\nUser chose '{}'. Continue the story in second person.", context, user_choice)
}

pub fn next_options(context: &str, user_choice: &str) -> String {
    format!("{}\nUser chose '{}'. What should the user decide next? Provide 5 options.", context, user_choice)
}

pub fn final_story(context: &str) -> String {
    format!(
        "Here is the path a reader took through an interactive story, one step per line:\n{}\n\n\
         Write the complete story that follows from these choices, in second person, \
         as a single continuous narrative.",
        context
    )
}

pub fn conversation_reply(context: &str, user_input: &str) -> String {
    format!("{}\nUser: {}", context, user_input)
}

fn list_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:\d+\s*[.):]|[-*•])\s+(.+?)\s*$").expect("valid regex"))
}

fn type_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*(?:\*\*)?(?:choice\s+type|type)(?:\*\*)?\s*:\s*(?:\*\*)?\s*(.+?)\s*(?:\*\*)?\s*$").expect("valid regex"))
}

fn strip_code_fence(text: &str) -> &str {
    let t = text.trim();
    let Some(rest) = t.strip_prefix("```") else { return t };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn clean_option(s: &str) -> String {
    s.trim().trim_matches('"').trim_matches('*').trim().to_string()
}

/// Reads a choice type and its options out of a model answer.
///
/// The JSON form is preferred; numbered or bulleted lists are accepted as a fallback.
pub fn parse_choice_set(text: &str) -> Result<ChoiceSet> {
    let body = strip_code_fence(text);
    let json_slice = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if end > start => Some(&body[start..=end]),
        _ => None,
    };
    if let Some(slice) = json_slice {
        if let Ok(set) = serde_json::from_str::<ChoiceSet>(slice) {
            let choices: Vec<String> = set.choices.iter().map(|c| clean_option(c)).filter(|c| !c.is_empty()).collect();
            if !choices.is_empty() {
                return Ok(ChoiceSet { choice_type: set.choice_type.trim().to_string(), choices });
            }
        }
    }

    let mut choice_type: Option<String> = None;
    let mut first_plain: Option<String> = None;
    let mut choices = Vec::new();
    for line in body.lines() {
        if let Some(cap) = type_line_re().captures(line) {
            choice_type.get_or_insert_with(|| clean_option(&cap[1]));
        } else if let Some(cap) = list_item_re().captures(line) {
            let option = clean_option(&cap[1]);
            if !option.is_empty() {
                choices.push(option);
            }
        } else if first_plain.is_none() && !line.trim().is_empty() {
            first_plain = Some(line.trim().trim_end_matches(':').to_string());
        }
    }
    if choices.is_empty() {
        bail!("no choices found in LLM answer");
    }
    let choice_type = choice_type.or(first_plain).unwrap_or_else(|| "choice".to_string());
    Ok(ChoiceSet { choice_type, choices })
}
