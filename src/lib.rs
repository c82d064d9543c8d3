pub mod app;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod handlers;
pub mod matcher;
pub mod store;
pub mod sync;
pub mod translate;
pub mod upstream;
