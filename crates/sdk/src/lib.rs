pub use parascan_backend;

pub mod bench;
pub mod config;
pub mod engine;
pub mod utils;
