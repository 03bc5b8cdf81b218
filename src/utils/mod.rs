pub mod keys;
pub mod retry;
pub mod run_guard;
