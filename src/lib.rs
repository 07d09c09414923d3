#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod backend;
pub mod comic;
pub mod comments;
pub mod config;
pub mod dates;
pub mod error;
pub mod favorites;
pub mod html;
pub mod identity;
pub mod rpc;
pub mod storage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
pub use error::{Error, Result};
