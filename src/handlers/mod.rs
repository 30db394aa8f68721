pub mod config;
pub mod evaluation;

pub use config::*;
pub use evaluation::*;
