//! Type definitions

pub mod import;
pub mod messages;
pub mod query;
pub mod resource;

pub use import::*;
pub use messages::*;
pub use query::*;
pub use resource::*;
