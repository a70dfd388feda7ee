//! Doctor command - verify system requirements and configuration.

use crate::app::App;
use crate::cli::Output;
use crate::config::Settings;
use crate::store::StatusCounts;
use console::style;
use std::path::Path;

/// Check result for a single item.
#[derive(Debug)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl CheckResult {
    fn ok(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Ok,
            message: message.to_string(),
            hint: None,
        }
    }

    fn warning(name: &str, message: &str, hint: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warning,
            message: message.to_string(),
            hint: Some(hint.to_string()),
        }
    }

    fn error(name: &str, message: &str, hint: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Error,
            message: message.to_string(),
            hint: Some(hint.to_string()),
        }
    }

    fn print(&self) {
        let icon = match self.status {
            CheckStatus::Ok => style("✓").green(),
            CheckStatus::Warning => style("!").yellow(),
            CheckStatus::Error => style("✗").red(),
        };

        println!("  {} {} - {}", icon, style(&self.name).bold(), self.message);

        if let Some(hint) = &self.hint {
            println!("    {} {}", style("→").dim(), style(hint).dim());
        }
    }
}

/// Run all diagnostic checks.
pub fn run_doctor(settings: &Settings, config_path: &Path) -> anyhow::Result<()> {
    Output::header("Rettelse Doctor");
    println!();
    println!("Checking configuration, database and API access...\n");

    let mut checks = Vec::new();

    println!("{}", style("Transcription").bold());
    let api_check = check_openai_api_key();
    api_check.print();
    checks.push(api_check);
    let model_check = check_models(settings);
    model_check.print();
    checks.push(model_check);

    println!();

    println!("{}", style("Storage").bold());
    let storage_checks = check_storage(settings);
    for check in &storage_checks {
        check.print();
    }
    checks.extend(storage_checks);

    println!();

    println!("{}", style("Configuration").bold());
    let config_check = check_config_file(config_path);
    config_check.print();
    checks.push(config_check);

    println!();

    let errors = checks.iter().filter(|c| c.status == CheckStatus::Error).count();
    let warnings = checks.iter().filter(|c| c.status == CheckStatus::Warning).count();

    if errors > 0 {
        Output::error(&format!(
            "{} error(s) found. Please fix them before running the worker.",
            errors
        ));
        std::process::exit(1);
    } else if warnings > 0 {
        Output::warning(&format!(
            "All checks passed with {} warning(s).",
            warnings
        ));
    } else {
        Output::success("All checks passed! Rettelse is ready to use.");
    }

    Ok(())
}

/// Check the model cascade configuration.
fn check_models(settings: &Settings) -> CheckResult {
    let transcription = &settings.transcription;
    if transcription.primary_model.trim().is_empty() {
        return CheckResult::error(
            "Models",
            "no primary model configured",
            "Set transcription.primary_model in the config file",
        );
    }
    if transcription.has_fallback() {
        CheckResult::ok(
            "Models",
            &format!("{} -> {}", transcription.primary_model, transcription.fallback_model),
        )
    } else {
        CheckResult::warning(
            "Models",
            &format!("{} (no fallback)", transcription.primary_model),
            "Set transcription.fallback_model to survive quota exhaustion",
        )
    }
}

/// Check if OpenAI API key is configured.
fn check_openai_api_key() -> CheckResult {
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) if key.starts_with("sk-") && key.len() > 20 => {
            let masked = format!("{}...{}", &key[..7], &key[key.len() - 4..]);
            CheckResult::ok("OPENAI_API_KEY", &format!("configured ({})", masked))
        }
        Ok(key) if key.is_empty() => CheckResult::error(
            "OPENAI_API_KEY",
            "empty",
            "Set with: export OPENAI_API_KEY='sk-...'",
        ),
        Ok(_) => CheckResult::warning(
            "OPENAI_API_KEY",
            "set but format looks unusual",
            "Expected format: sk-... (OpenAI API key)",
        ),
        Err(_) => CheckResult::error(
            "OPENAI_API_KEY",
            "not set",
            "Set with: export OPENAI_API_KEY='sk-...'",
        ),
    }
}

/// Check the data directory and the job database.
fn check_storage(settings: &Settings) -> Vec<CheckResult> {
    let mut results = Vec::new();

    let data_dir = settings.data_dir();
    if data_dir.exists() {
        results.push(CheckResult::ok(
            "Data directory",
            &format!("{}", data_dir.display()),
        ));
    } else {
        results.push(CheckResult::warning(
            "Data directory",
            &format!("{} (will be created)", data_dir.display()),
            "Directory will be created on first use",
        ));
    }

    let db_path = settings.sqlite_path();
    if !db_path.exists() {
        results.push(CheckResult::warning(
            "Database",
            &format!("{} (not created yet)", db_path.display()),
            "Database will be created on first import",
        ));
        return results;
    }

    let size = std::fs::metadata(&db_path)
        .map(|m| format_size(m.len()))
        .unwrap_or_else(|_| "unknown size".to_string());
    match App::open(settings.clone()).and_then(|app| app.queue().summary(None)) {
        Ok(summary) => {
            results.push(CheckResult::ok(
                "Database",
                &format!("{} ({})", db_path.display(), size),
            ));
            results.push(queue_check(&summary.totals));
        }
        Err(e) => results.push(CheckResult::error(
            "Database",
            &format!("{} could not be opened: {}", db_path.display(), e),
            "Check file permissions or move the file aside to start fresh",
        )),
    }

    results
}

/// Report queue counts, warning about failures and stuck work.
fn queue_check(counts: &StatusCounts) -> CheckResult {
    let message = format!(
        "{} queued, {} processing, {} done, {} failed",
        counts.queued, counts.processing, counts.done, counts.failed
    );
    if counts.failed > 0 {
        CheckResult::warning("Queue", &message, "Requeue failures with: rettelse retry <video_id>")
    } else {
        CheckResult::ok("Queue", &message)
    }
}

/// Check if config file exists.
fn check_config_file(config_path: &Path) -> CheckResult {
    if config_path.exists() {
        CheckResult::ok("Config file", &format!("{}", config_path.display()))
    } else {
        CheckResult::warning(
            "Config file",
            "using defaults",
            "Create with: rettelse config edit",
        )
    }
}

/// Format file size in human-readable format.
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_result_ok() {
        let result = CheckResult::ok("test", "passed");
        assert_eq!(result.status, CheckStatus::Ok);
        assert!(result.hint.is_none());
    }

    #[test]
    fn test_check_result_error() {
        let result = CheckResult::error("test", "failed", "fix it");
        assert_eq!(result.status, CheckStatus::Error);
        assert_eq!(result.hint, Some("fix it".to_string()));
    }

    #[test]
    fn test_queue_check_warns_on_failures() {
        let healthy = StatusCounts { queued: 2, done: 5, ..Default::default() };
        assert_eq!(queue_check(&healthy).status, CheckStatus::Ok);

        let failing = StatusCounts { failed: 1, ..Default::default() };
        let result = queue_check(&failing);
        assert_eq!(result.status, CheckStatus::Warning);
        assert!(result.message.contains("1 failed"));
    }

    #[test]
    fn test_missing_primary_model_is_an_error() {
        let mut settings = Settings::default();
        assert_ne!(check_models(&settings).status, CheckStatus::Error);

        settings.transcription.primary_model = String::new();
        assert_eq!(check_models(&settings).status, CheckStatus::Error);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1024 * 1024), "1.0 MB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.0 GB");
    }
}
