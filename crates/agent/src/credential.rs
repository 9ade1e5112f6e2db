// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-backed credential store and stable agent identity.
//!
//! Tokens live under `$XDG_STATE_HOME/onsembl/` (defaulting to
//! `~/.local/state/onsembl/`). `token:refresh` frames replace the stored
//! token in place; `refresh()` re-reads the file so a concurrent
//! `auth login` is picked up without restarting the wrapper.

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Pluggable credential source, injected into the session.
pub trait CredentialStore: Send + Sync {
    /// Current access token, if any.
    fn get(&self) -> anyhow::Result<Option<String>>;
    /// Persist a new access token (from `auth login` or `token:refresh`).
    fn store(&self, token: &str) -> anyhow::Result<()>;
    /// One refresh attempt after an auth failure. Returns the new token
    /// when one is available.
    fn refresh(&self) -> anyhow::Result<Option<String>>;
}

/// Resolve the wrapper state directory.
pub fn state_dir(override_dir: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = override_dir {
        std::fs::create_dir_all(dir)?;
        return Ok(dir.to_path_buf());
    }
    let state_home = std::env::var("XDG_STATE_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_default();
        format!("{home}/.local/state")
    });
    let dir = PathBuf::from(state_home).join("onsembl");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Token file under the state dir.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(state_dir: &Path) -> Self {
        Self { path: state_dir.join("token") }
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> anyhow::Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(token) => {
                let token = token.trim().to_owned();
                Ok((!token.is_empty()).then_some(token))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, token: &str) -> anyhow::Result<()> {
        std::fs::write(&self.path, token)?;
        Ok(())
    }

    fn refresh(&self) -> anyhow::Result<Option<String>> {
        // The file is the source of truth; a re-read picks up any token the
        // operator installed since we last looked.
        self.get()
    }
}

/// A fixed token supplied on the command line; refresh falls back to the
/// file store so `auth login` can still rescue an expired key.
pub struct StaticWithFallback {
    token: String,
    fallback: FileCredentialStore,
}

impl StaticWithFallback {
    pub fn new(token: String, state_dir: &Path) -> Self {
        Self { token, fallback: FileCredentialStore::new(state_dir) }
    }
}

impl CredentialStore for StaticWithFallback {
    fn get(&self) -> anyhow::Result<Option<String>> {
        Ok(Some(self.token.clone()))
    }

    fn store(&self, token: &str) -> anyhow::Result<()> {
        self.fallback.store(token)
    }

    fn refresh(&self) -> anyhow::Result<Option<String>> {
        self.fallback.get()
    }
}

/// Load the stable agent id for this host+name, creating one on first run.
/// Dashboards rely on the id staying fixed across wrapper restarts.
pub fn load_or_create_agent_id(state_dir: &Path, agent_name: &str) -> anyhow::Result<Uuid> {
    let sanitized: String =
        agent_name.chars().map(|c| if c.is_alphanumeric() { c } else { '-' }).collect();
    let path = state_dir.join(format!("agent-id-{sanitized}"));
    if let Ok(contents) = std::fs::read_to_string(&path) {
        if let Ok(id) = Uuid::parse_str(contents.trim()) {
            return Ok(id);
        }
    }
    let id = Uuid::new_v4();
    std::fs::write(&path, id.to_string())?;
    Ok(id)
}

#[cfg(test)]
#[path = "credential_tests.rs"]
mod tests;
