use std::collections::HashMap;
use std::env::{self, VarError};

/// Provides a wrapper around variables
/// provided by the current environment.
pub trait EnvVars: Send + Sync {
    /// Fetches the environment variable `key` from the current process or equivalent
    /// environment.
    ///
    /// An implementation of this trait should return VarErrors
    /// in failure to retrieve an environment variable.
    fn var(&self, key: &str) -> Result<String, VarError>;
    /// Clones the environment variables, this will usually be a shallow clone
    /// used to share references to the environment variables provider.
    fn clone_env_vars(&self) -> Box<dyn EnvVars>;
}

/// Environment variables sourced from the current process.
pub struct ProcessEnvVars {}

impl ProcessEnvVars {
    /// Creates a new instance of environment variables
    /// sourced from the current process.
    pub fn new() -> Self {
        ProcessEnvVars {}
    }
}

impl Default for ProcessEnvVars {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvVars for ProcessEnvVars {
    fn var(&self, key: &str) -> Result<String, VarError> {
        env::var(key)
    }

    fn clone_env_vars(&self) -> Box<dyn EnvVars> {
        Box::new(ProcessEnvVars {})
    }
}

impl Clone for Box<dyn EnvVars> {
    fn clone(&self) -> Self {
        self.clone_env_vars()
    }
}

/// Environment variables backed by an in-memory map,
/// used in tests and sandbox environments where mutating
/// the process environment is not desirable.
#[derive(Clone, Default)]
pub struct MapEnvVars {
    vars: HashMap<String, String>,
}

impl MapEnvVars {
    pub fn new(vars: HashMap<String, String>) -> Self {
        MapEnvVars { vars }
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }
}

impl EnvVars for MapEnvVars {
    fn var(&self, key: &str) -> Result<String, VarError> {
        self.vars.get(key).cloned().ok_or(VarError::NotPresent)
    }

    fn clone_env_vars(&self) -> Box<dyn EnvVars> {
        Box::new(self.clone())
    }
}
