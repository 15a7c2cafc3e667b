pub mod models;
pub mod topic;

pub use models::*;
