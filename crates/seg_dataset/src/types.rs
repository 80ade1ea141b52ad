//! Core types and error definitions for seg_dataset.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, SegDatasetError>;

#[derive(Debug, Error)]
pub enum SegDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("sample list {path} contains no entries")]
    EmptyList { path: PathBuf },
    #[error("sample {name}: label value {value} is not below num_classes {num_classes}")]
    LabelOutOfRange {
        name: String,
        value: i64,
        num_classes: usize,
    },
    #[error("sample {name}: {msg}")]
    ShapeMismatch { name: String, msg: String },
    #[error("loader worker {worker} stopped: {msg}")]
    Worker { worker: usize, msg: String },
    #[error("{0}")]
    Other(String),
}

/// Which dataset family a run trains on. Selects the optimizer in the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Multi-organ abdominal CT slices.
    #[default]
    Synapse,
    /// Single-channel ASSD slices.
    Assd,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Synapse => "synapse",
            DatasetKind::Assd => "assd",
        }
    }
}

/// One image/mask pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SegSample {
    pub name: String,
    /// Image in CHW layout, normalized to [0, 1].
    pub image: Vec<f32>,
    /// Class index per pixel, HW layout.
    pub label: Vec<i64>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl SegSample {
    /// Builds a sample, checking buffer lengths against the dimensions.
    pub fn new(
        name: impl Into<String>,
        image: Vec<f32>,
        label: Vec<i64>,
        channels: usize,
        height: usize,
        width: usize,
    ) -> DatasetResult<Self> {
        let name = name.into();
        if image.len() != channels * height * width {
            return Err(SegDatasetError::ShapeMismatch {
                name,
                msg: format!(
                    "image buffer has {} values, expected {channels}x{height}x{width}",
                    image.len()
                ),
            });
        }
        if label.len() != height * width {
            return Err(SegDatasetError::ShapeMismatch {
                name,
                msg: format!(
                    "label buffer has {} values, expected {height}x{width}",
                    label.len()
                ),
            });
        }
        Ok(Self {
            name,
            image,
            label,
            channels,
            height,
            width,
        })
    }

    pub fn plane(&self, channel: usize) -> &[f32] {
        let size = self.height * self.width;
        &self.image[channel * size..(channel + 1) * size]
    }

    pub fn check_labels(&self, num_classes: usize) -> DatasetResult<()> {
        match self
            .label
            .iter()
            .find(|v| **v < 0 || **v as usize >= num_classes)
        {
            Some(value) => Err(SegDatasetError::LabelOutOfRange {
                name: self.name.clone(),
                value: *value,
                num_classes,
            }),
            None => Ok(()),
        }
    }
}
