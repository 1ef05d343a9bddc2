pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod query;

pub use error::{StoreError, StoreResult};
