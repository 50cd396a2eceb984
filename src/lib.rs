pub mod types;
pub mod error;
pub mod config;
pub mod exchange;
pub mod data;
pub mod analytics;
pub mod index;
pub mod pipeline;
pub mod utils;

pub use types::*;
pub use error::{IndexError, Result};
