pub mod application;
pub mod config;
pub mod consts;
pub mod errors;
pub mod operator_api;
pub mod telemetry;
pub mod types;
