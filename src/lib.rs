pub mod config;
pub mod duplicate;
pub mod frame;
pub mod hub;
pub mod server;
pub mod store;
pub mod sweeper;
pub mod track;
