//! The epoch/batch training loop.

use anyhow::Context;
use burn::backend::Autodiff;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer, SgdConfig};
use burn::tensor::backend::Backend;
use indicatif::{ProgressBar, ProgressStyle};
use models::UNetSta;
use rand::rngs::StdRng;
use rand::SeedableRng;
use seg_dataset::{
    DatasetKind, FolderDataset, LoaderConfig, RandomGenerator, SegLoader, SegmentationDataset,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::checkpoint::{save_model, write_run_config, CheckpointPolicy};
use crate::config::{validate_backend_choice, TrainArgs, TrainConfig};
use crate::kd::KdLoss;
use crate::logging::{init_logging, ScalarWriter, LOG_FILE};
use crate::loss::{cross_entropy_2d, DiceLoss, LossValues};
use crate::schedule::{cosine_schedule, LrSchedule, PolyLrScheduler, ScheduleKind};
use crate::TrainBackend;

pub type ADBackend = Autodiff<TrainBackend>;

#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub snapshot_dir: PathBuf,
    pub iterations: usize,
    pub iters_per_epoch: usize,
    pub checkpoints: Vec<PathBuf>,
    pub last_loss: Option<LossValues>,
}

/// CLI entry point: resolves the config and trains on the configured split.
pub fn run_train(args: TrainArgs) -> anyhow::Result<TrainSummary> {
    validate_backend_choice(args.backend)?;
    let cfg = args.resolve()?;
    cfg.validate()?;
    let dataset = FolderDataset::open(&cfg.root_path, &cfg.list_dir, &cfg.split, cfg.in_channels)
        .with_context(|| format!("failed to open dataset at {}", cfg.root_path.display()))?;
    train(&cfg, Arc::new(dataset))
}

/// Trains a fresh network on `dataset`, writing logs, scalars and
/// checkpoints under `cfg.snapshot_dir()`.
pub fn train(cfg: &TrainConfig, dataset: Arc<dyn SegmentationDataset>) -> anyhow::Result<TrainSummary> {
    cfg.validate()?;
    let snapshot = cfg.snapshot_dir();
    fs::create_dir_all(&snapshot)
        .with_context(|| format!("failed to create snapshot dir {}", snapshot.display()))?;
    let _log = init_logging(Some(&snapshot.join(LOG_FILE)))?;
    info!("{cfg:?}");
    write_run_config(&snapshot, cfg)?;
    info!("The length of train set is: {}", dataset.len());

    let device = <ADBackend as Backend>::Device::default();
    let model = UNetSta::<ADBackend>::new(&cfg.model_config(), &device);

    match cfg.dataset {
        DatasetKind::Synapse => {
            let optim = SgdConfig::new()
                .with_momentum(Some(
                    MomentumConfig::new()
                        .with_momentum(0.9)
                        .with_dampening(0.0),
                ))
                .with_weight_decay(Some(WeightDecayConfig::new(1e-4)))
                .init();
            train_loop(cfg, &snapshot, dataset, model, optim, &device)
        }
        DatasetKind::Assd => {
            let optim = AdamWConfig::new().with_weight_decay(5e-4).init();
            train_loop(cfg, &snapshot, dataset, model, optim, &device)
        }
    }
}

fn train_loop<O>(
    cfg: &TrainConfig,
    snapshot: &Path,
    dataset: Arc<dyn SegmentationDataset>,
    mut model: UNetSta<ADBackend>,
    mut optim: O,
    device: &<ADBackend as Backend>::Device,
) -> anyhow::Result<TrainSummary>
where
    O: Optimizer<UNetSta<ADBackend>, ADBackend>,
{
    let loader = SegLoader::new(
        dataset,
        Some(RandomGenerator::new((cfg.img_size, cfg.img_size))),
        LoaderConfig {
            batch_size: cfg.effective_batch_size(),
            shuffle: true,
            seed: cfg.seed,
            num_workers: cfg.num_workers,
            prefetch: cfg.prefetch,
            drop_last: false,
            num_classes: Some(cfg.num_classes),
        },
    )?;
    if loader.is_empty() {
        anyhow::bail!("training set is empty");
    }
    let iters_per_epoch = loader.len();
    let max_iterations = cfg.max_epochs * iters_per_epoch;
    info!("{iters_per_epoch} iterations per epoch. {max_iterations} max iterations ");

    let mut schedule = match cfg.schedule {
        ScheduleKind::Poly => LrSchedule::Poly(PolyLrScheduler::new(cfg.base_lr, max_iterations)),
        ScheduleKind::Cosine => LrSchedule::Cosine {
            table: cosine_schedule(
                cfg.base_lr,
                cfg.final_lr,
                cfg.max_epochs,
                iters_per_epoch,
                cfg.warmup_epochs,
                0.0,
            ),
            iter: 0,
        },
    };
    let dice_loss = DiceLoss::new(cfg.num_classes);
    let kd_loss = cfg.loss.kd_enabled().then(|| KdLoss::new(cfg.loss.kd));
    let mut kd_rng = StdRng::seed_from_u64(cfg.seed);
    let policy = CheckpointPolicy::new(cfg.save_after, cfg.max_epochs);
    let mut scalars = ScalarWriter::create(snapshot)?;

    let pb = ProgressBar::new(cfg.max_epochs as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );

    let mut iter_num = 0usize;
    let mut checkpoints = Vec::new();
    let mut last_loss = None;

    for epoch in 0..cfg.max_epochs {
        pb.set_message(format!("epoch {epoch}"));
        for (i_batch, batch) in loader.epoch(epoch)?.enumerate() {
            let batch = batch
                .with_context(|| format!("failed to load batch {i_batch} of epoch {epoch}"))?
                .to_tensors::<ADBackend>(device);

            let (logits, kd_term) = match &kd_loss {
                Some(kd) => {
                    let features = model.forward_features(batch.images);
                    let term = kd.forward(&features, &mut kd_rng);
                    (features.logits, Some(term))
                }
                None => (model.forward(batch.images), None),
            };
            let loss_ce = cross_entropy_2d(logits.clone(), batch.labels.clone());
            let loss_dice = dice_loss.forward(logits, batch.labels, true);
            let losses = cfg.loss.combine(loss_ce, loss_dice, kd_term);
            let values = losses.values();

            let lr = schedule.step();
            let grads = GradientsParams::from_grads(losses.total.backward(), &model);
            model = optim.step(lr, model, grads);

            if i_batch % 10 == 0 {
                pb.println(format!(
                    "Epoch {epoch} mini batch {i_batch} total mini batches {iters_per_epoch} loss {:.6}",
                    values.total
                ));
            }
            if !values.total.is_finite() {
                warn!(iteration = iter_num, "non-finite loss {}", values.total);
            }

            scalars.add_scalar("info/lr", lr, iter_num)?;
            scalars.add_scalar("info/total_loss", values.total as f64, iter_num)?;
            scalars.add_scalar("info/dice_loss", values.dice as f64, iter_num)?;
            scalars.add_scalar("info/loss_ce", values.ce as f64, iter_num)?;
            if let Some(kd) = values.kd {
                scalars.add_scalar("info/loss_kd", kd as f64, iter_num)?;
            }
            info!(
                "iteration {iter_num} : loss : {:.6}, loss_dice {:.6} loss_ce: {:.6}",
                values.total, values.dice, values.ce
            );

            iter_num += 1;
            last_loss = Some(values);
        }

        if policy.should_save(epoch) {
            let path = save_model(&model, snapshot, epoch)?;
            info!("save model to {}", path.display());
            checkpoints.push(path);
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    scalars.close()?;
    info!("Training Finished!");

    Ok(TrainSummary {
        snapshot_dir: snapshot.to_path_buf(),
        iterations: iter_num,
        iters_per_epoch,
        checkpoints,
        last_loss,
    })
}
