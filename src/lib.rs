pub mod app;
pub mod error;
pub mod gateway;
pub mod models;
pub mod platform;
pub mod storage;

pub use error::{Error, Result};
pub use gateway::{CallerContext, Gateway};
