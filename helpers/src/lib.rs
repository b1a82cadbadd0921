pub mod env;
pub mod redis;
pub mod retries;
pub mod runtime_types;
pub mod time;
