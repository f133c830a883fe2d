// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persisted watermark
//!
//! The publisher can keep its watermark in a small JSON file so a restart
//! resumes after the last confirmed record instead of re-sending the whole
//! table. Writes go to a temporary sibling and are renamed into place.

use crate::cursor::Position;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint {path} is not valid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Watermark checkpoint file.
#[derive(Debug, Clone)]
pub struct WatermarkCheckpoint {
    path: PathBuf,
}

impl WatermarkCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn io_err(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Atomically replace the checkpoint with `position`.
    pub async fn save(&self, position: &Position) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec(position).map_err(|source| CheckpointError::Json {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }

        let tmp = self.tmp_path();
        fs::write(&tmp, &body).await.map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        Ok(())
    }

    /// Load the last saved watermark. A missing file means "start from the
    /// beginning".
    pub async fn load(&self) -> Result<Option<Position>, CheckpointError> {
        let body = match fs::read(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };

        let position = serde_json::from_slice(&body).map_err(|source| CheckpointError::Json {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(position))
    }

    /// Delete the checkpoint file if present.
    pub async fn remove(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}
