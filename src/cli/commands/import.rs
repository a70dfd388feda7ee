//! Import command - register a split video.

use crate::app::App;
use crate::cli::Output;
use crate::config::Settings;
use crate::store::VideoManifest;
use anyhow::{Context, Result};

/// Run the import command.
pub fn run_import(manifest_path: &str, enqueue: bool, settings: Settings) -> Result<()> {
    let path = Settings::expand_path(manifest_path);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    let manifest: VideoManifest = serde_json::from_str(&content)
        .with_context(|| format!("Invalid manifest {}", path.display()))?;

    let app = App::open(settings)?;
    let chunks = app.import(&manifest)?;

    Output::success(&format!(
        "Imported {} ({} chunks)",
        manifest.video_id,
        chunks.len()
    ));

    if enqueue {
        let outcome = app.queue().enqueue(&manifest.video_id)?;
        Output::info(&format!(
            "Queued {} jobs ({} already active)",
            outcome.queued, outcome.skipped_duplicate
        ));
    }

    Ok(())
}
