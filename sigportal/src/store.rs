// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Local copy of the portal's hardware support dataset.
//!
//! The portal occasionally sends the list of hardware it supports along with a work request.
//! The most recent copy is kept in the state directory, along with when it was received, so
//! the agent only asks for it every so often.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// The file, relative to the state directory, holding the dataset.
pub const HARDWARE_FILE: &str = "supported-hardware.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stored {
    /// Milliseconds since the Unix epoch.
    last_sync: u64,
    dataset: serde_json::Value,
}

#[derive(Debug)]
pub struct HardwareStore {
    path: PathBuf,
    stored: Mutex<Option<Stored>>,
}

impl HardwareStore {
    /// Open the store in `state_directory`.
    ///
    /// A missing or unreadable file is treated as an empty store.
    pub fn open(state_directory: &Path) -> Self {
        let path = state_directory.join(HARDWARE_FILE);
        let stored = match std::fs::read(&path) {
            Ok(contents) => serde_json::from_slice(&contents)
                .inspect_err(|error| {
                    tracing::warn!(path = %path.display(), ?error, "Ignoring corrupt hardware dataset");
                })
                .ok(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                tracing::warn!(path = %path.display(), ?error, "Unable to read hardware dataset");
                None
            }
        };

        Self {
            path,
            stored: Mutex::new(stored),
        }
    }

    /// When the dataset was last received, if ever.
    pub fn last_sync(&self) -> Option<SystemTime> {
        self.stored
            .lock()
            .expect("lock is poisoned")
            .as_ref()
            .map(|stored| UNIX_EPOCH + Duration::from_millis(stored.last_sync))
    }

    #[cfg(test)]
    fn dataset(&self) -> Option<serde_json::Value> {
        self.stored
            .lock()
            .expect("lock is poisoned")
            .as_ref()
            .map(|stored| stored.dataset.clone())
    }

    /// Replace the dataset, noting it was received at `now`.
    pub fn store(&self, dataset: &serde_json::Value, now: SystemTime) -> anyhow::Result<()> {
        let last_sync = now
            .duration_since(UNIX_EPOCH)
            .context("the clock is set before the Unix epoch")?
            .as_millis();
        let stored = Stored {
            last_sync: u64::try_from(last_sync).context("the clock is set too far ahead")?,
            dataset: dataset.clone(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let partial = self.path.with_extension("json.partial");
        std::fs::write(&partial, serde_json::to_vec_pretty(&stored)?)
            .with_context(|| format!("failed to write {}", partial.display()))?;
        std::fs::rename(&partial, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        *self.stored.lock().expect("lock is poisoned") = Some(stored);
        tracing::info!(path = %self.path.display(), "Stored hardware support dataset");
        Ok(())
    }
}
