pub mod config;
pub mod coordinator;
pub mod cron;
pub mod duration;
pub mod error;
pub mod events;
pub mod models;
pub mod policy;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod timer;

pub use config::DaemonConfig;
pub use coordinator::Coordinator;
pub use error::ControlError;
pub use events::{Event, EventKind};
pub use models::{Phase, RestartPolicy, Schedule, Workload};
pub use store::Store;
