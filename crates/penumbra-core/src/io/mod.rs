pub mod cache;
pub mod download;
