//! Process command - drain the queue in the foreground.

use crate::app::App;
use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use anyhow::Result;

/// Run the worker until the queue is empty.
pub async fn run_process(settings: Settings) -> Result<()> {
    preflight::check(Operation::Process)?;

    let app = App::open(settings)?;
    let worker = app.openai_worker()?;

    let pending = app.queue().summary(None)?.totals.outstanding();
    if pending == 0 {
        Output::info("Queue is empty.");
        return Ok(());
    }

    let pb = Output::progress_bar(pending, "transcribing");
    let summary = worker
        .drain(|report| {
            pb.inc(1);
            let job = &report.job;
            if report.succeeded() {
                pb.set_message(format!("chunk {} done ({} segments)", job.chunk_id, report.segments));
            } else {
                pb.println(format!(
                    "  chunk {} failed: {}",
                    job.chunk_id,
                    job.last_error.as_deref().unwrap_or("unknown error")
                ));
            }
        })
        .await?;
    pb.finish_and_clear();

    if summary.reclaimed > 0 {
        Output::warning(&format!("Reclaimed {} stale jobs", summary.reclaimed));
    }
    if summary.failed > 0 {
        Output::warning(&format!(
            "{} done, {} failed. Requeue failures with: rettelse retry <video_id>",
            summary.done, summary.failed
        ));
    } else {
        Output::success(&format!("{} jobs done", summary.done));
    }
    Ok(())
}
