pub mod bus;
pub mod cache;
pub mod common;
pub mod config;
pub mod domain;
pub mod exchange;
pub mod fetch;
pub mod manager;
pub mod stream;
