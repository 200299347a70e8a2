//! CI/CD data models.

pub mod artifact;
pub mod freestyle;
pub mod host;
pub mod notification;
pub mod pipeline;
pub mod status;
pub mod trigger;

pub use status::{JobStatus, RunStatus};
pub use trigger::{TriggerInfo, TriggerKind};
