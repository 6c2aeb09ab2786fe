pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
pub mod service;
pub mod state;
pub mod telemetry;
