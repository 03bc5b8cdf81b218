pub mod converter;
pub mod queue;
pub mod storage;
