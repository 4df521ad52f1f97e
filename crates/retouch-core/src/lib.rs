pub mod artifact;
pub mod config;
pub mod error;
pub mod executor;
pub mod media;
pub mod provider;
pub mod session;
pub mod workflow;

pub use error::{Result, RetouchError};
