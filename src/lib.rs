pub mod aggregator;
#[cfg(feature = "browser")]
pub mod browser;
pub mod config;
pub mod data_models;
pub mod error;
pub mod evaluator;
pub mod extractor;
pub mod fetcher;
pub mod headers;
pub mod pipeline;
pub mod proxy;
pub mod scoring;
pub mod search;
pub mod sink;
