pub mod access_log;
pub mod api;
pub mod cache;
pub mod config;
pub mod constants;
pub mod http_range;
pub mod library;
pub mod logging;
pub mod metrics;
pub mod reader;
pub mod response;
pub mod server;
pub mod stream;
