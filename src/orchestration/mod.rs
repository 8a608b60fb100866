// Batch orchestration: worker pool scheduling and live progress

pub mod batch_orchestrator;
pub mod progress;

pub use batch_orchestrator::{BatchOrchestrator, ItemCallback};
pub use progress::ProgressTracker;
