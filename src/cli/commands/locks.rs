//! Annotator commands: lock, review and chunk inspection.

use crate::app::App;
use crate::cli::output::format_duration;
use crate::cli::{LockAction, Output};
use crate::config::Settings;
use crate::store::ProcessingState;
use anyhow::Result;
use console::style;
use std::time::Duration;

pub fn run_lock(action: &LockAction, settings: Settings) -> Result<()> {
    let app = App::open(settings)?;
    let locks = app.locks();

    match action {
        LockAction::Acquire { chunk_id, user, ttl } => {
            let grant = locks.acquire(*chunk_id, user, ttl.map(Duration::from_secs))?;
            Output::success(&format!(
                "Chunk {} locked by {} until {}",
                grant.chunk_id,
                grant.locked_by,
                grant.expires_at.format("%H:%M:%S")
            ));
        }
        LockAction::Renew { chunk_id, user } => {
            let grant = locks.renew(*chunk_id, user)?;
            Output::success(&format!(
                "Chunk {} renewed until {}",
                grant.chunk_id,
                grant.expires_at.format("%H:%M:%S")
            ));
        }
        LockAction::Release { chunk_id, user } => {
            if locks.release(*chunk_id, user)? {
                Output::success(&format!("Chunk {} released", chunk_id));
            } else {
                Output::info(&format!("Chunk {} was not locked", chunk_id));
            }
        }
        LockAction::Status { chunk_id } => match locks.status(*chunk_id)? {
            Some(lock) => Output::kv(
                &format!("Chunk {}", chunk_id),
                &format!(
                    "locked by {} until {}",
                    lock.locked_by,
                    lock.expires_at.format("%H:%M:%S")
                ),
            ),
            None => Output::kv(&format!("Chunk {}", chunk_id), "unlocked"),
        },
    }
    Ok(())
}

pub fn run_review(chunk_id: i64, user: &str, state: &str, settings: Settings) -> Result<()> {
    let to: ProcessingState = state.parse()?;
    let app = App::open(settings)?;
    let chunk = app.review(chunk_id, user, to)?;
    Output::success(&format!("Chunk {} is now {}", chunk.id, chunk.processing_state));
    Ok(())
}

pub fn run_chunk(chunk_id: i64, json: bool, settings: Settings) -> Result<()> {
    let app = App::open(settings)?;
    let chunk = app.database().require_chunk(chunk_id)?;
    let lock = chunk.active_lock(app.clock().now());
    let segments = app.database().segments(chunk_id)?;

    if json {
        let value = serde_json::json!({
            "chunk": chunk,
            "lock": lock,
            "segments": segments,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    Output::header(&format!("Chunk {} ({} #{})", chunk.id, chunk.video_id, chunk.index));
    Output::kv(
        "Range",
        &format!(
            "{:.1}s - {:.1}s ({})",
            chunk.start_seconds,
            chunk.end_seconds,
            format_duration(chunk.duration_seconds())
        ),
    );
    Output::kv("Audio", &chunk.audio_path);
    Output::kv("State", chunk.processing_state.as_str());
    Output::kv("Denoise", chunk.denoise_state.as_str());
    match &lock {
        Some(lock) => Output::kv("Lock", &format!("{} until {}", lock.locked_by, lock.expires_at)),
        None => Output::kv("Lock", "none"),
    }

    if !segments.is_empty() {
        println!();
        for segment in &segments {
            Output::list_item(&format!(
                "{} {}",
                style(format!("[{:>6.2} - {:>6.2}]", segment.start_seconds, segment.end_seconds)).dim(),
                segment.text
            ));
            if !segment.translation.is_empty() {
                println!("      {}", style(&segment.translation).italic());
            }
        }
    }
    Ok(())
}
