pub mod inference;
pub mod memory_queue;
pub mod protocol;
pub mod queue;
pub mod submitter;
pub mod worker;
