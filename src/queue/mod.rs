// Run scheduling

pub mod workers;

pub use workers::{RunQueue, WorkerPool};
