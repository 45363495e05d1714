pub mod cpu;
pub mod disk;
pub mod process;
pub mod snapshot;

pub use self::snapshot::Engine;
