//! Prompt templates for Rettelse.
//!
//! Prompts can be customized by placing TOML files in the custom prompts directory.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Collection of all prompt templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Prompts {
    /// Prompts for correcting and translating a chunk transcript.
    pub transcription: TranscriptionPrompts,
    /// Custom variables from config, available in all prompts.
    #[serde(skip)]
    pub variables: HashMap<String, String>,
}

/// Prompts sent alongside each chunk to the transcription service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionPrompts {
    pub system: String,
    pub user: String,
}

impl Default for TranscriptionPrompts {
    fn default() -> Self {
        Self {
            system: r#"You are a transcription editor. You receive a machine transcript of one short audio chunk, split into timestamped segments, and return a corrected version with a translation.

## Output
JSON object with a "segments" array. Each segment has:
- "start": start time in seconds from the beginning of the chunk
- "end": end time in seconds from the beginning of the chunk
- "text": the corrected transcript in the spoken language
- "translation": the same segment translated into {{target_language}}

## Rules
- Keep the segment order and timing of the input; merge or split only at sentence boundaries
- Never invent speech that is not present in the input
- Fix obvious recognition errors, punctuation and capitalization
- Segments must not overlap and end must not be earlier than start
- Return only the JSON object"#
                .to_string(),

            user: r#"Recording: {{title}}
Chunk {{chunk_index}} ({{chunk_range}})

Machine transcript segments:
{{source_segments}}"#
                .to_string(),
        }
    }
}

impl Prompts {
    /// Load prompts from the default location, with optional custom directory and variables.
    pub fn load(
        custom_dir: Option<&str>,
        custom_variables: Option<&HashMap<String, String>>,
    ) -> crate::error::Result<Self> {
        let mut prompts = Prompts::default();

        if let Some(vars) = custom_variables {
            prompts.variables = vars.clone();
        }

        if let Some(dir) = custom_dir {
            let custom_path = PathBuf::from(shellexpand::tilde(dir).to_string());

            let transcription_path = custom_path.join("transcription.toml");
            if transcription_path.exists() {
                let content = std::fs::read_to_string(&transcription_path)?;
                prompts.transcription = toml::from_str(&content)?;
            }
        }

        Ok(prompts)
    }

    /// Render a prompt template with the given variables.
    pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
        let mut result = template.to_string();
        for (key, value) in vars {
            result = result.replace(&format!("{{{{{}}}}}", key), value);
        }
        result
    }

    /// Render a prompt template with both provided variables and custom config variables.
    /// Provided variables take precedence over custom config variables.
    pub fn render_with_custom(&self, template: &str, vars: &HashMap<String, String>) -> String {
        let mut merged = self.variables.clone();
        for (key, value) in vars {
            merged.insert(key.clone(), value.clone());
        }
        Self::render(template, &merged)
    }
}
