pub mod cache;
pub mod client;
pub mod config;
pub mod events;
pub mod http;
pub mod model;
pub mod proxy;
pub mod signal;
pub mod upstream;
pub mod validation;
