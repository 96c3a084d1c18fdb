//! Business logic services

pub mod bus;
pub mod import_jobs;
pub mod import_pipeline;
pub mod job_locks;
pub mod query_client;
pub mod store;
