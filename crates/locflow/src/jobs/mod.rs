pub mod attempts;
pub mod maintenance;
pub mod model;
pub mod queue;
pub mod retry;
pub mod runner;

pub use attempts::{AttemptsRepo, JobAttempt};
pub use maintenance::{cutoff_hours, MaintenanceRepo};
pub use model::{ClonePayload, CountPayload, Job, JobStatus, NewJob, NotifyPayload, Stage};
pub use queue::JobsRepo;
pub use runner::{FailureOutcome, JobRunner};
