pub mod config;
pub mod error;
pub mod event;
pub mod ingest;
pub mod offsets;
pub mod schema;
pub mod sink;
pub mod tailer;
