pub mod lifecycle;
pub mod phone;
pub mod service;
pub mod types;
