pub mod assignment;
pub mod coordinator;
pub mod directory;
pub mod lifecycle;
pub mod queue;
pub mod scoring;
