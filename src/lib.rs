pub mod config;
pub mod engine;
pub mod error;
pub mod k8s;
pub mod server;
pub mod stream;
