//! Configuration module for Rettelse.
//!
//! Handles loading and managing application settings and prompt templates.

mod prompts;
mod settings;

pub use prompts::{Prompts, TranscriptionPrompts};
pub use settings::{
    DatabaseSettings, GeneralSettings, LockSettings, NotifierSettings, PromptSettings,
    QueueSettings, ServerSettings, Settings, TranscriptionSettings, WorkerSettings,
};
