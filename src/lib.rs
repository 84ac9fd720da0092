pub mod cache;
pub mod config;
pub mod sync;
pub mod transfer;
