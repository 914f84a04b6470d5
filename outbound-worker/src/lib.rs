pub mod bulk;
pub mod config;
pub mod consumer;
pub mod context;
pub mod document;
pub mod error;
pub mod retry;
