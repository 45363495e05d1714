//! Host telemetry sampling: CPU usage with a rate-limited cache, top
//! processes, a deadline-bounded disk usage fan-out and whole-host snapshots.

pub mod clock;
pub mod collectors;
pub mod config;
pub mod facts;
pub mod metrics;
pub mod model;

pub use collectors::Engine;
pub use config::Config;
