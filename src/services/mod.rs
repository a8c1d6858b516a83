pub mod compute;
pub mod coordinator;
pub mod profiler;
pub mod publisher;
pub mod queue;
pub mod result_store;
pub mod retry;
pub mod storage;
pub mod worker;
