//! Indexable image/mask datasets.

use crate::types::{DatasetResult, SegDatasetError, SegSample};
use std::fs;
use std::path::{Path, PathBuf};

/// Indexable source of image/label pairs. Shared across loader workers.
pub trait SegmentationDataset: Send + Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> DatasetResult<SegSample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Samples listed in `<list_dir>/<split>.txt`, stored as
/// `<root>/images/<name>.png` and `<root>/labels/<name>.png`.
///
/// Label pixels hold the class index directly.
#[derive(Debug, Clone)]
pub struct FolderDataset {
    root: PathBuf,
    names: Vec<String>,
    channels: usize,
}

impl FolderDataset {
    pub fn open(
        root: impl Into<PathBuf>,
        list_dir: &Path,
        split: &str,
        channels: usize,
    ) -> DatasetResult<Self> {
        let list_path = list_dir.join(format!("{split}.txt"));
        let raw = fs::read_to_string(&list_path).map_err(|source| SegDatasetError::Io {
            path: list_path.clone(),
            source,
        })?;
        let names = parse_sample_list(&raw);
        if names.is_empty() {
            return Err(SegDatasetError::EmptyList { path: list_path });
        }
        if channels != 1 && channels != 3 {
            return Err(SegDatasetError::Other(format!(
                "unsupported channel count {channels}; expected 1 or 3"
            )));
        }
        Ok(Self {
            root: root.into(),
            names,
            channels,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn image_path(&self, name: &str) -> PathBuf {
        self.root.join("images").join(format!("{name}.png"))
    }

    pub fn label_path(&self, name: &str) -> PathBuf {
        self.root.join("labels").join(format!("{name}.png"))
    }
}

/// One name per line; blank lines and `#` comments are skipped.
pub fn parse_sample_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn open_image(path: &Path) -> DatasetResult<image::DynamicImage> {
    image::open(path).map_err(|source| SegDatasetError::Image {
        path: path.to_path_buf(),
        source,
    })
}

impl SegmentationDataset for FolderDataset {
    fn len(&self) -> usize {
        self.names.len()
    }

    fn get(&self, index: usize) -> DatasetResult<SegSample> {
        let name = self.names.get(index).ok_or_else(|| {
            SegDatasetError::Other(format!(
                "index {index} out of range for {} samples",
                self.names.len()
            ))
        })?;

        let img = open_image(&self.image_path(name))?;
        let (width, height) = (img.width() as usize, img.height() as usize);
        let mut image = Vec::with_capacity(self.channels * width * height);
        if self.channels == 1 {
            image.extend(img.to_luma8().as_raw().iter().map(|v| *v as f32 / 255.0));
        } else {
            let rgb = img.to_rgb8();
            for c in 0..3 {
                for p in rgb.pixels() {
                    image.push(p[c] as f32 / 255.0);
                }
            }
        }

        let mask = open_image(&self.label_path(name))?.to_luma8();
        if mask.width() as usize != width || mask.height() as usize != height {
            return Err(SegDatasetError::ShapeMismatch {
                name: name.clone(),
                msg: format!(
                    "label is {}x{}, image is {width}x{height}",
                    mask.width(),
                    mask.height()
                ),
            });
        }
        let label = mask.as_raw().iter().map(|v| *v as i64).collect();

        SegSample::new(name.clone(), image, label, self.channels, height, width)
    }
}

/// Dataset held in memory; used for synthetic runs and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<SegSample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<SegSample>) -> Self {
        Self { samples }
    }
}

impl SegmentationDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> DatasetResult<SegSample> {
        self.samples.get(index).cloned().ok_or_else(|| {
            SegDatasetError::Other(format!(
                "index {index} out of range for {} samples",
                self.samples.len()
            ))
        })
    }
}
