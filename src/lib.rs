pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod push;
pub mod resolver;
pub mod snapshot;

pub use error::Error;
