//! API request handlers

mod health;
mod system;

pub use health::*;
pub use system::*;
