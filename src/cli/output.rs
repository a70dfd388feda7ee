//! CLI output formatting utilities.

use crate::store::{Job, JobStatus, QueueSummary, StatusCounts};
use console::{style, StyledObject};
use indicatif::{ProgressBar, ProgressStyle};

/// Output helper for CLI formatting.
pub struct Output;

impl Output {
    /// Print an info message.
    pub fn info(msg: &str) {
        println!("{} {}", style(">>").cyan().bold(), msg);
    }

    /// Print a success message.
    pub fn success(msg: &str) {
        println!("{} {}", style(">>").green().bold(), msg);
    }

    /// Print a warning message.
    pub fn warning(msg: &str) {
        eprintln!("{} {}", style(">>").yellow().bold(), msg);
    }

    /// Print an error message.
    pub fn error(msg: &str) {
        eprintln!("{} {}", style(">>").red().bold(), msg);
    }

    /// Print a header.
    pub fn header(msg: &str) {
        println!("\n{}", style(msg).bold().underlined());
    }

    /// Print a key-value pair.
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", style(key).dim(), value);
    }

    /// Print a list item.
    pub fn list_item(msg: &str) {
        println!("  {} {}", style("*").cyan(), msg);
    }

    /// Print one line of status counts.
    pub fn counts(label: &str, counts: &StatusCounts) {
        println!(
            "  {:<24} {} queued  {} processing  {} done  {} failed",
            style(label).bold(),
            style(counts.queued).cyan(),
            style(counts.processing).yellow(),
            style(counts.done).green(),
            style(counts.failed).red(),
        );
    }

    /// Print a queue summary, totals first.
    pub fn summary(summary: &QueueSummary) {
        Self::counts("All videos", &summary.totals);
        for video in &summary.per_video {
            Self::counts(&video.video_id, &video.counts);
        }
    }

    /// Print one job history row.
    pub fn job(job: &Job) {
        let finished = job
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  #{:<6} chunk {:<6} {:<12} attempts {}  {}  {}",
            job.id,
            job.chunk_id,
            status_style(job.status),
            job.attempt_count,
            style(finished).dim(),
            job.model_used.as_deref().unwrap_or(""),
        );
        if let Some(error) = &job.last_error {
            println!("          {}", style(content_preview(error, 160)).red());
        }
    }

    /// Create a progress bar.
    pub fn progress_bar(len: u64, msg: &str) -> ProgressBar {
        let pb = ProgressBar::new(len);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb.set_message(msg.to_string());
        pb
    }
}

fn status_style(status: JobStatus) -> StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        JobStatus::Queued => s.cyan(),
        JobStatus::Processing => s.yellow(),
        JobStatus::Done => s.green(),
        JobStatus::Failed => s.red(),
    }
}

/// Format duration in seconds to a human-readable string.
pub fn format_duration(seconds: f64) -> String {
    let total_seconds = seconds.max(0.0) as u32;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Truncate content with ellipsis.
fn content_preview(content: &str, max_len: usize) -> String {
    let content = content.replace('\n', " ");
    if content.chars().count() <= max_len {
        content
    } else {
        let cut: String = content.chars().take(max_len).collect();
        format!("{}...", cut)
    }
}
