pub mod config;
pub mod conversations;

pub use config::*;
pub use conversations::*;
