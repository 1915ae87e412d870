pub mod adapter;
pub mod approval;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod intake;
pub mod io;
pub mod paths;
pub mod request;
pub mod scheduler;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{Result, TechnicError};
