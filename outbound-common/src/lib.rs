pub mod accounting;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod enricher;
pub mod error;
pub mod filterer;
pub mod metrics;
pub mod metrics_consts;
pub mod outcome;
pub mod processor;
pub mod publisher;
pub mod storage;
pub mod test_utils;
pub mod tokenizer;
pub mod tracker;
