//! Pre-flight checks before expensive operations.
//!
//! Validates that required configuration is available before starting
//! operations that would otherwise fail on the first job.

use crate::error::{Result, RettelseError};

/// Requirements for different operations.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    /// Processing jobs calls the transcription service.
    Process,
    /// Queue and lock bookkeeping only touches the database.
    Bookkeeping,
}

/// Run pre-flight checks for the given operation.
pub fn check(operation: Operation) -> Result<()> {
    match operation {
        Operation::Process => check_api_key()?,
        Operation::Bookkeeping => {}
    }
    Ok(())
}

/// Check if OpenAI API key is configured.
fn check_api_key() -> Result<()> {
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) if !key.is_empty() => Ok(()),
        Ok(_) => Err(RettelseError::Config(
            "OPENAI_API_KEY is empty. Set it with: export OPENAI_API_KEY='sk-...'".to_string(),
        )),
        Err(_) => Err(RettelseError::Config(
            "OPENAI_API_KEY not set. Set it with: export OPENAI_API_KEY='sk-...'".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bookkeeping_has_no_requirements() {
        assert!(check(Operation::Bookkeeping).is_ok());
    }
}
