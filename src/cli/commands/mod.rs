//! CLI command implementations.

mod config;
mod doctor;
mod import;
mod locks;
mod process;
mod queue;
mod serve;

pub use config::run_config;
pub use doctor::run_doctor;
pub use import::run_import;
pub use locks::{run_chunk, run_lock, run_review};
pub use process::run_process;
pub use queue::{run_enqueue, run_jobs, run_reclaim, run_retry, run_status};
pub use serve::{router, run_serve, AppState};
