mod app;
mod coordinator;
mod orchestrator;
mod policy;

pub use app::{build_router, AppState};
pub use coordinator::{RetryCoordinator, UploadRetrier, DEFAULT_DEBOUNCE};
pub use orchestrator::{
    result_for_outcome, OrchestratorConfig, RecoveryReport, UploadEvent, UploadOrchestrator,
};
pub use policy::{AutoUploadPolicy, CategoryPolicy};
