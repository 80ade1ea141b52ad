use anyhow::Context;
use burn::tensor::backend::Backend;
use clap::Parser;
use seg_dataset::{FolderDataset, LoaderConfig, RandomGenerator, SegLoader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use training::checkpoint::{load_model, read_run_config};
use training::logging::init_logging;
use training::metrics::evaluate;
use training::{validate_backend_choice, BackendKind, TrainBackend};

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Score a UNet-STA checkpoint on a split (per-class hard Dice)"
)]
struct Args {
    /// Run directory written by `train` (holds train_config.json).
    #[arg(long)]
    run_dir: PathBuf,
    /// Checkpoint to load; defaults to the highest epoch in the run directory.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Split list to evaluate (<list_dir>/<split>.txt).
    #[arg(long, default_value = "test")]
    split: String,
    /// Overrides the dataset root recorded in the run config.
    #[arg(long)]
    root_path: Option<PathBuf>,
    /// Overrides the list directory recorded in the run config.
    #[arg(long)]
    list_dir: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
    #[arg(long, default_value_t = 4)]
    batch_size: usize,
    #[arg(long, default_value_t = 4)]
    num_workers: usize,
}

fn latest_checkpoint(dir: &Path) -> anyhow::Result<PathBuf> {
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        let epoch = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("epoch_"))
            .and_then(|n| n.strip_suffix(".bin"))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(epoch) = epoch {
            if best.as_ref().map_or(true, |(e, _)| epoch > *e) {
                best = Some((epoch, path));
            }
        }
    }
    best.map(|(_, p)| p)
        .ok_or_else(|| anyhow::anyhow!("no epoch_<n>.bin checkpoints in {}", dir.display()))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log = init_logging(None)?;
    validate_backend_choice(args.backend)?;

    let cfg = read_run_config(&args.run_dir)?;
    let checkpoint = match args.checkpoint {
        Some(path) => path,
        None => latest_checkpoint(&args.run_dir)?,
    };
    let root = args.root_path.unwrap_or_else(|| cfg.root_path.clone());
    let list_dir = args.list_dir.unwrap_or_else(|| cfg.list_dir.clone());

    let device = <TrainBackend as Backend>::Device::default();
    let model = load_model::<TrainBackend>(&cfg.model_config(), &checkpoint, &device)?;
    info!("loaded {}", checkpoint.display());

    let dataset = FolderDataset::open(&root, &list_dir, &args.split, cfg.in_channels)?;
    let loader = SegLoader::new(
        Arc::new(dataset),
        Some(RandomGenerator::resize_only((cfg.img_size, cfg.img_size))),
        LoaderConfig {
            batch_size: args.batch_size,
            shuffle: false,
            num_workers: args.num_workers,
            seed: cfg.seed,
            ..Default::default()
        },
    )?;

    let report = evaluate(&model, &loader, cfg.num_classes, &device)?;
    for (class, dice) in report.per_class.iter().enumerate() {
        info!("class {class}: dice {dice:.4}");
    }
    info!(
        "{} samples, mean foreground dice {:.4}",
        report.samples, report.mean_dice
    );
    Ok(())
}
