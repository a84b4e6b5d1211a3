//! Integration tests for the purser inventory resolution layer


mod cache_resolution;
mod concurrent_resolution;
mod guest_execution;
mod operation_dispatch;
