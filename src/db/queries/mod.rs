//! Database queries

pub mod import_job;
pub mod resource;
