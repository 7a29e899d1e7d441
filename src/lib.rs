pub mod config;
pub mod error;
pub mod manifest;
pub mod matcher;
pub mod notify;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod scheduler;
pub mod server;
pub mod stages;
pub mod tasks;
pub mod validation;
pub mod watch;

pub use config::PathConfig;
pub use error::Fault;
pub use pipeline::{FileRecord, Pipeline, Stage, StageRegistry};
pub use scheduler::{RunContext, RunMode, Scheduler, TaskNode, TaskRegistry};
