//! Run configuration: serde defaults, an optional TOML file and CLI overrides.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use models::{DecoderVariant, UNetStaConfig};
use seg_dataset::DatasetKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::loss::LossWeights;
use crate::schedule::ScheduleKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub dataset: DatasetKind,
    /// Dataset root holding `images/` and `labels/`.
    pub root_path: PathBuf,
    /// Directory holding `<split>.txt` sample lists.
    pub list_dir: PathBuf,
    pub split: String,
    /// Parent of the per-run snapshot directory.
    pub output_dir: PathBuf,
    pub num_classes: usize,
    pub in_channels: usize,
    pub img_size: usize,
    pub base_lr: f64,
    /// Per-device batch size; the loader uses `batch_size · n_gpu`.
    pub batch_size: usize,
    pub n_gpu: usize,
    pub max_epochs: usize,
    pub seed: u64,
    pub num_workers: usize,
    pub prefetch: usize,
    /// Every epoch after this one is checkpointed.
    pub save_after: usize,
    pub loss: LossWeights,
    pub schedule: ScheduleKind,
    pub warmup_epochs: usize,
    pub final_lr: f64,
    pub base_channels: usize,
    pub decoder: DecoderVariant,
    pub n_iter: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Synapse,
            root_path: PathBuf::from("data/Synapse/train"),
            list_dir: PathBuf::from("lists/lists_Synapse"),
            split: "train".to_string(),
            output_dir: PathBuf::from("model_out"),
            num_classes: 9,
            in_channels: 1,
            img_size: 224,
            base_lr: 0.01,
            batch_size: 24,
            n_gpu: 1,
            max_epochs: 150,
            seed: 1234,
            num_workers: 8,
            prefetch: 2,
            save_after: 80,
            loss: LossWeights::default(),
            schedule: ScheduleKind::Poly,
            warmup_epochs: 0,
            final_lr: 0.0,
            base_channels: 64,
            decoder: DecoderVariant::Transposed,
            n_iter: 1,
        }
    }
}

impl TrainConfig {
    pub fn from_toml_path(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Batch size seen by the loader.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size * self.n_gpu
    }

    pub fn model_config(&self) -> UNetStaConfig {
        let mut cfg = UNetStaConfig::new(self.in_channels, self.num_classes)
            .with_base_channels(self.base_channels)
            .with_decoder(self.decoder);
        cfg.n_iter = self.n_iter;
        cfg
    }

    /// Run directory under `output_dir`, named after the settings that
    /// distinguish runs.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.output_dir.join(format!(
            "{}_{}_bs{}_lr{}_ep{}_s{}",
            self.dataset.as_str(),
            self.img_size,
            self.effective_batch_size(),
            self.base_lr,
            self.max_epochs,
            self.seed
        ))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 || self.n_gpu == 0 {
            anyhow::bail!("batch_size and n_gpu must be at least 1");
        }
        if self.max_epochs == 0 {
            anyhow::bail!("max_epochs must be at least 1");
        }
        if self.img_size == 0 || self.img_size % 16 != 0 {
            anyhow::bail!(
                "img_size {} must be a positive multiple of 16 (four 2x poolings)",
                self.img_size
            );
        }
        if self.dataset == DatasetKind::Assd && self.in_channels != 1 {
            anyhow::bail!("assd slices are single-channel; got in_channels {}", self.in_channels);
        }
        if self.base_lr.is_nan() || self.base_lr <= 0.0 {
            anyhow::bail!("base_lr must be positive, got {}", self.base_lr);
        }
        self.model_config()
            .validate()
            .context("invalid model configuration")?;
        Ok(())
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetArg {
    Synapse,
    Assd,
}

impl From<DatasetArg> for DatasetKind {
    fn from(value: DatasetArg) -> Self {
        match value {
            DatasetArg::Synapse => DatasetKind::Synapse,
            DatasetArg::Assd => DatasetKind::Assd,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderArg {
    Transposed,
    Gated,
}

impl From<DecoderArg> for DecoderVariant {
    fn from(value: DecoderArg) -> Self {
        match value {
            DecoderArg::Transposed => DecoderVariant::Transposed,
            DecoderArg::Gated => DecoderVariant::Gated,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleArg {
    Poly,
    Cosine,
}

impl From<ScheduleArg> for ScheduleKind {
    fn from(value: ScheduleArg) -> Self {
        match value {
            ScheduleArg::Poly => ScheduleKind::Poly,
            ScheduleArg::Cosine => ScheduleKind::Cosine,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "train", about = "Train the UNet-STA segmentation network")]
pub struct TrainArgs {
    /// TOML file with a full or partial `TrainConfig`; flags below override it.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Dataset family; selects the optimizer.
    #[arg(long, value_enum)]
    pub dataset: Option<DatasetArg>,
    /// Dataset root containing images/ and labels/.
    #[arg(long)]
    pub root_path: Option<PathBuf>,
    /// Directory with the <split>.txt sample lists.
    #[arg(long)]
    pub list_dir: Option<PathBuf>,
    /// Output directory; each run writes to its own subdirectory.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    #[arg(long)]
    pub num_classes: Option<usize>,
    #[arg(long)]
    pub in_channels: Option<usize>,
    /// Input patch size (square).
    #[arg(long)]
    pub img_size: Option<usize>,
    #[arg(long)]
    pub base_lr: Option<f64>,
    /// Per-device batch size.
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Device count; multiplies the batch size.
    #[arg(long)]
    pub n_gpu: Option<usize>,
    #[arg(long)]
    pub max_epochs: Option<usize>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Data-loading worker threads.
    #[arg(long)]
    pub num_workers: Option<usize>,
    /// Feature-distillation coefficient (0 disables).
    #[arg(long)]
    pub kd_weight: Option<f32>,
    #[arg(long, value_enum)]
    pub schedule: Option<ScheduleArg>,
    #[arg(long, value_enum)]
    pub decoder: Option<DecoderArg>,
    /// Base channel width of the network.
    #[arg(long)]
    pub base_channels: Option<usize>,
}

impl TrainArgs {
    /// Config file (or defaults) with every given flag applied on top.
    pub fn resolve(&self) -> anyhow::Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::from_toml_path(path)?,
            None => TrainConfig::default(),
        };
        if let Some(v) = self.dataset {
            cfg.dataset = v.into();
        }
        if let Some(v) = &self.root_path {
            cfg.root_path = v.clone();
        }
        if let Some(v) = &self.list_dir {
            cfg.list_dir = v.clone();
        }
        if let Some(v) = &self.output_dir {
            cfg.output_dir = v.clone();
        }
        if let Some(v) = self.num_classes {
            cfg.num_classes = v;
        }
        if let Some(v) = self.in_channels {
            cfg.in_channels = v;
        }
        if let Some(v) = self.img_size {
            cfg.img_size = v;
        }
        if let Some(v) = self.base_lr {
            cfg.base_lr = v;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.n_gpu {
            cfg.n_gpu = v;
        }
        if let Some(v) = self.max_epochs {
            cfg.max_epochs = v;
        }
        if let Some(v) = self.seed {
            cfg.seed = v;
        }
        if let Some(v) = self.num_workers {
            cfg.num_workers = v;
        }
        if let Some(v) = self.base_channels {
            cfg.base_channels = v;
        }
        if let Some(v) = self.kd_weight {
            cfg.loss.kd = v;
        }
        if let Some(v) = self.schedule {
            cfg.schedule = v.into();
        }
        if let Some(v) = self.decoder {
            cfg.decoder = v.into();
        }
        Ok(cfg)
    }
}

/// Refuses a backend that was not compiled in. Building with `backend-wgpu`
/// always trains on WGPU.
pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; training will still use the WGPU backend despite --backend nd-array");
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = TrainConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.effective_batch_size(), 24);
    }

    #[test]
    fn img_size_must_divide_by_16() {
        let cfg = TrainConfig {
            img_size: 100,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("run.toml");
        fs::write(
            &path,
            "dataset = \"assd\"\nmax_epochs = 90\nschedule = \"cosine\"\n\n[loss]\nce = 0.5\ndice = 0.5\nkd = 0.0\n",
        )?;
        let args = TrainArgs::parse_from(["train", "--config", path.to_str().unwrap_or_default(), "--seed", "7"]);
        let cfg = args.resolve()?;
        assert_eq!(cfg.dataset, DatasetKind::Assd);
        assert_eq!(cfg.max_epochs, 90);
        assert_eq!(cfg.schedule, ScheduleKind::Cosine);
        assert_eq!(cfg.loss.ce, 0.5);
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.img_size, 224);
        Ok(())
    }

    #[test]
    fn flags_override_defaults() {
        let args = TrainArgs::parse_from([
            "train",
            "--dataset",
            "assd",
            "--batch-size",
            "4",
            "--n-gpu",
            "2",
            "--kd-weight",
            "0.5",
        ]);
        let cfg = args.resolve().unwrap();
        assert_eq!(cfg.dataset, DatasetKind::Assd);
        assert_eq!(cfg.effective_batch_size(), 8);
        assert!(cfg.loss.kd_enabled());
        assert_eq!(cfg.base_lr, TrainConfig::default().base_lr);
    }
}
