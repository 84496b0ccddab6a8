pub mod app;
pub mod cli;
pub mod error;
pub mod logging;
pub mod models;
pub mod platform;
pub mod storage;

pub use error::{Error, Result};
pub use models::{ModelManager, ModelManagerBuilder};
