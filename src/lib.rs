pub mod config;
pub mod engine;
pub mod error;
pub mod flock;
pub mod tmpfs;

pub use config::StoreConfig;
pub use engine::Store;
pub use error::{Error, Result};
