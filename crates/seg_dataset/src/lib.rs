//! Segmentation data pipeline for UNet-STA training.
//!
//! This crate provides:
//! - Image/mask datasets backed by a PNG folder or held in memory
//! - Paired geometric augmentation (rot90/flip, small rotation, resize)
//! - A multi-threaded, prefetching batch loader producing Burn tensors

pub mod aug;
pub mod dataset;
pub mod loader;
pub mod types;

pub use aug::RandomGenerator;
pub use dataset::{parse_sample_list, FolderDataset, InMemoryDataset, SegmentationDataset};
pub use loader::{EpochIter, HostBatch, LoaderConfig, SegBatch, SegLoader};
pub use types::*;
