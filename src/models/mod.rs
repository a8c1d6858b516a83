pub mod artifact;
pub mod job;
pub mod report;
pub mod submission;
