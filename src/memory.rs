//! Persisted user facts.
//!
//! A flat JSON array of short fact strings at `~/.cua/memory.json`, easy to
//! inspect and edit by hand. Facts are de-duplicated case-insensitively and
//! flushed to disk on every add.

use crate::error::{AgentError, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

#[derive(Debug)]
pub struct MemoryStore {
    path: PathBuf,
    facts: Mutex<Vec<String>>,
}

impl MemoryStore {
    /// Open the store at `path`, loading existing facts if the file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn open(path: &Path) -> Result<Self> {
        let facts = if path.exists() {
            let body = std::fs::read_to_string(path)?;
            serde_json::from_str::<Vec<String>>(&body)
                .map_err(|e| AgentError::Memory(format!("invalid memory file: {e}")))?
        } else {
            Vec::new()
        };
        Ok(Self {
            path: path.to_owned(),
            facts: Mutex::new(facts),
        })
    }

    /// Open the store at the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open_default() -> Result<Self> {
        Self::open(&crate::cua_dirs::memory_path())
    }

    /// Add a fact and flush to disk. Returns `false` for duplicates
    /// (compared case-insensitively) and blank facts.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn add(&self, fact: &str) -> Result<bool> {
        let fact = fact.trim();
        if fact.is_empty() {
            return Ok(false);
        }
        let snapshot = {
            let mut facts = self
                .facts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let lowered = fact.to_lowercase();
            if facts.iter().any(|f| f.to_lowercase() == lowered) {
                return Ok(false);
            }
            facts.push(fact.to_owned());
            facts.clone()
        };
        self.flush(&snapshot)?;
        info!("remembered: {fact}");
        Ok(true)
    }

    /// Current facts in insertion order.
    #[must_use]
    pub fn facts(&self) -> Vec<String> {
        self.facts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn flush(&self, facts: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(facts)
            .map_err(|e| AgentError::Memory(format!("failed to serialize memory: {e}")))?;
        std::fs::write(&self.path, body)?;
        Ok(())
    }
}
