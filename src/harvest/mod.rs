//! Image harvesting pipeline
//! Query generation, search, pooled downloads and dedup of the asset tree

pub mod config_loader;
pub mod dedup;
pub mod download;
pub mod label_index;
pub mod logger;
pub mod orchestration;
pub mod query_builder;
pub mod rate_limiter;
pub mod search;
pub mod worker_pool;

// Re-export what the binary wires together
pub use config_loader::init_config;
pub use logger::init_logger;
pub use orchestration::{BatchSummary, init_orchestrator};
