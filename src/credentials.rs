//! Credential Lookup
//!
//! Passwords are never kept in the main configuration file. They are looked
//! up by username from a credential store when a session starts.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// Password lookup keyed by username
pub trait CredentialStore: Send + Sync {
    /// Return the password for `username`, or `None` when there is no entry
    fn password(&self, username: &str) -> Option<String>;
}

/// In-memory credential store
#[derive(Debug, Default, Clone)]
pub struct MemoryCredentials {
    entries: HashMap<String, String>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the password for a username
    pub fn set(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.entries.insert(username.into(), password.into());
    }

    /// Remove the password for a username, returns true if one existed
    pub fn remove(&mut self, username: &str) -> bool {
        self.entries.remove(username).is_some()
    }

    pub fn with(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.set(username, password);
        self
    }
}

impl CredentialStore for MemoryCredentials {
    fn password(&self, username: &str) -> Option<String> {
        self.entries.get(username).cloned()
    }
}

/// Credential store backed by a TOML file of `username = "password"` pairs
#[derive(Debug, Clone)]
pub struct FileCredentials {
    inner: MemoryCredentials,
}

impl FileCredentials {
    /// Load credentials from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigurationInvalid(format!("cannot read credentials file {:?}: {}", path, e))
        })?;
        let store = Self::from_str(&content)?;
        debug!("Loaded {} credential(s) from {:?}", store.inner.entries.len(), path);
        Ok(store)
    }

    /// Parse credentials from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let entries: HashMap<String, String> = toml::from_str(content)?;
        Ok(Self {
            inner: MemoryCredentials { entries },
        })
    }
}

impl CredentialStore for FileCredentials {
    fn password(&self, username: &str) -> Option<String> {
        self.inner.password(username)
    }
}
