pub mod app;
pub mod config;
pub mod event;
pub mod honeycred;
pub mod logger;
pub mod modules;
pub mod sink;
pub mod transport;
