//! Queue bookkeeping commands: enqueue, status, retry, jobs, reclaim.

use crate::app::App;
use crate::cli::Output;
use crate::config::Settings;
use anyhow::Result;

pub fn run_enqueue(video_ids: &[String], settings: Settings) -> Result<()> {
    let app = App::open(settings)?;
    let outcome = app.queue().enqueue_many(video_ids)?;

    if outcome.queued == 0 {
        Output::info(&format!(
            "Nothing new to queue ({} chunks already have an active job)",
            outcome.skipped_duplicate
        ));
    } else {
        Output::success(&format!(
            "Queued {} jobs ({} duplicates skipped)",
            outcome.queued, outcome.skipped_duplicate
        ));
    }
    Ok(())
}

pub fn run_status(video: Option<&str>, settings: Settings) -> Result<()> {
    let app = App::open(settings)?;
    let summary = app.queue().summary(video)?;

    Output::header("Queue");
    if summary.totals.total() == 0 {
        Output::info("No jobs.");
    } else {
        Output::summary(&summary);
    }
    Ok(())
}

pub fn run_retry(video_id: &str, settings: Settings) -> Result<()> {
    let app = App::open(settings)?;
    let retried = app.queue().retry_failed(video_id)?;

    if retried == 0 {
        Output::info(&format!("No failed jobs to retry for {}", video_id));
    } else {
        Output::success(&format!("Requeued {} failed jobs for {}", retried, video_id));
    }
    Ok(())
}

pub fn run_jobs(video_id: &str, settings: Settings) -> Result<()> {
    let app = App::open(settings)?;
    if app.database().video(video_id)?.is_none() {
        anyhow::bail!("Unknown video: {}", video_id);
    }

    let jobs = app.queue().jobs_for_video(video_id)?;
    Output::header(&format!("Jobs for {}", video_id));
    if jobs.is_empty() {
        Output::info("No jobs yet. Queue them with: rettelse enqueue <video_id>");
    }
    for job in &jobs {
        Output::job(job);
    }
    Ok(())
}

pub fn run_reclaim(settings: Settings) -> Result<()> {
    let window = settings.worker.stale_after();
    let app = App::open(settings)?;
    let reclaimed = app.queue().reclaim_stale(window)?;

    if reclaimed == 0 {
        Output::info("No stale jobs.");
    } else {
        Output::warning(&format!(
            "Marked {} stale jobs as FAILED. Requeue them with: rettelse retry <video_id>",
            reclaimed
        ));
    }
    Ok(())
}
