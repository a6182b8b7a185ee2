//! Common utilities shared by the modules of stratum

pub mod client_context;
pub mod profiler;
pub mod types;
pub mod utils;
pub mod uuid;
