pub mod ai;
pub mod analysis;
pub mod queue;
pub mod registry;
pub mod storage;
pub mod submission;
