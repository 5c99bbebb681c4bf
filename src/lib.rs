pub mod types;
pub mod error;
pub mod data;
pub mod broker;
pub mod config;

pub use types::*;
pub use error::{Result, BarCacheError};
