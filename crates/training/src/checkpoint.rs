//! Epoch checkpoints and the run config saved beside them.

use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use models::{UNetSta, UNetStaConfig};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::TrainConfig;

pub const RUN_CONFIG_FILE: &str = "train_config.json";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to record weights at {path}: {msg}")]
    Recorder { path: PathBuf, msg: String },
    #[error("invalid run config at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Save every epoch after `save_after`, and always the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub save_after: usize,
    pub max_epochs: usize,
}

impl CheckpointPolicy {
    pub fn new(save_after: usize, max_epochs: usize) -> Self {
        Self {
            save_after,
            max_epochs,
        }
    }

    pub fn should_save(&self, epoch: usize) -> bool {
        epoch > self.save_after || epoch + 1 >= self.max_epochs
    }

    pub fn planned_epochs(&self) -> Vec<usize> {
        (0..self.max_epochs).filter(|e| self.should_save(*e)).collect()
    }
}

pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("epoch_{epoch}.bin"))
}

pub fn save_model<B: Backend>(
    model: &UNetSta<B>,
    dir: &Path,
    epoch: usize,
) -> Result<PathBuf, CheckpointError> {
    fs::create_dir_all(dir).map_err(|source| CheckpointError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = checkpoint_path(dir, epoch);
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path.clone(), &recorder)
        .map_err(|e| CheckpointError::Recorder {
            path: path.clone(),
            msg: e.to_string(),
        })?;
    Ok(path)
}

pub fn load_model<B: Backend>(
    cfg: &UNetStaConfig,
    path: &Path,
    device: &B::Device,
) -> Result<UNetSta<B>, CheckpointError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    UNetSta::<B>::new(cfg, device)
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| CheckpointError::Recorder {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })
}

pub fn write_run_config(dir: &Path, cfg: &TrainConfig) -> Result<PathBuf, CheckpointError> {
    let path = dir.join(RUN_CONFIG_FILE);
    let json = serde_json::to_vec_pretty(cfg).map_err(|source| CheckpointError::Json {
        path: path.clone(),
        source,
    })?;
    fs::write(&path, json).map_err(|source| CheckpointError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

pub fn read_run_config(dir: &Path) -> Result<TrainConfig, CheckpointError> {
    let path = dir.join(RUN_CONFIG_FILE);
    let raw = fs::read(&path).map_err(|source| CheckpointError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| CheckpointError::Json { path, source })
}
