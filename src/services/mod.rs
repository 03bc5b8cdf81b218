pub mod conversion_worker;
pub mod converter;
pub mod queue;
pub mod scanner;
pub mod staging;
pub mod storage;
pub mod worker;
