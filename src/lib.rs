pub mod config;
pub mod engine;
pub mod manifest;
pub mod mux;
pub mod notify;
pub mod sink;
pub mod source;
