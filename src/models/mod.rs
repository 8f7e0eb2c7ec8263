pub mod detection;
pub mod job;
