//! Worker-pool batch loader.
//!
//! Each epoch spawns `num_workers` threads. Batch `b` of the epoch is built by
//! worker `b % num_workers`, which pushes it into its own bounded channel; the
//! consumer pulls the channels round-robin so batches arrive in order while up
//! to `prefetch` batches per worker are prepared ahead of compute.
//!
//! Sample order is a permutation seeded by `seed + epoch`. Worker `w` augments
//! with an RNG seeded by `seed + w`, so a run is reproducible for a fixed
//! worker count.

use crate::aug::RandomGenerator;
use crate::dataset::SegmentationDataset;
use crate::types::{DatasetResult, SegDatasetError, SegSample};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use crossbeam_channel::{bounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub num_workers: usize,
    /// Batches each worker may prepare ahead of the consumer.
    pub prefetch: usize,
    /// Drop the last partial batch.
    pub drop_last: bool,
    /// When set, every label value must be below this.
    pub num_classes: Option<usize>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 24,
            shuffle: true,
            seed: 1234,
            num_workers: 8,
            prefetch: 2,
            drop_last: false,
            num_classes: None,
        }
    }
}

/// Host-side batch, built on a worker thread.
#[derive(Debug, Clone)]
pub struct HostBatch {
    pub names: Vec<String>,
    /// NCHW image values.
    pub images: Vec<f32>,
    /// NHW class indices.
    pub labels: Vec<i64>,
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

/// Device-side batch.
#[derive(Debug, Clone)]
pub struct SegBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 3, Int>,
}

impl HostBatch {
    pub fn collate(samples: Vec<SegSample>) -> DatasetResult<Self> {
        let Some(first) = samples.first() else {
            return Err(SegDatasetError::Other("cannot collate empty batch".to_string()));
        };
        let (channels, height, width) = (first.channels, first.height, first.width);
        let batch = samples.len();
        let mut names = Vec::with_capacity(batch);
        let mut images = Vec::with_capacity(batch * channels * height * width);
        let mut labels = Vec::with_capacity(batch * height * width);
        for sample in samples {
            if (sample.channels, sample.height, sample.width) != (channels, height, width) {
                return Err(SegDatasetError::ShapeMismatch {
                    name: sample.name,
                    msg: format!(
                        "batch mixes {}x{}x{} with {channels}x{height}x{width}; set an output size to force consistency",
                        sample.channels, sample.height, sample.width
                    ),
                });
            }
            images.extend_from_slice(&sample.image);
            labels.extend_from_slice(&sample.label);
            names.push(sample.name);
        }
        Ok(Self {
            names,
            images,
            labels,
            batch,
            channels,
            height,
            width,
        })
    }

    pub fn to_tensors<B: Backend>(self, device: &B::Device) -> SegBatch<B> {
        let images = Tensor::<B, 1>::from_floats(self.images.as_slice(), device).reshape([
            self.batch,
            self.channels,
            self.height,
            self.width,
        ]);
        let labels = Tensor::<B, 3, Int>::from_data(
            TensorData::new(self.labels, [self.batch, self.height, self.width]),
            device,
        );
        SegBatch { images, labels }
    }
}

pub struct SegLoader {
    dataset: Arc<dyn SegmentationDataset>,
    transform: Option<RandomGenerator>,
    cfg: LoaderConfig,
}

impl SegLoader {
    pub fn new(
        dataset: Arc<dyn SegmentationDataset>,
        transform: Option<RandomGenerator>,
        cfg: LoaderConfig,
    ) -> DatasetResult<Self> {
        if cfg.batch_size == 0 {
            return Err(SegDatasetError::Other("batch_size must be at least 1".to_string()));
        }
        Ok(Self {
            dataset,
            transform,
            cfg,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.cfg
    }

    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        let n = self.dataset.len();
        if self.cfg.drop_last {
            n / self.cfg.batch_size
        } else {
            n.div_ceil(self.cfg.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample indices for `epoch`, grouped into batches.
    pub fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.cfg.shuffle {
            let mut rng = StdRng::seed_from_u64(self.cfg.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        let mut batches: Vec<Vec<usize>> = order
            .chunks(self.cfg.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        if self.cfg.drop_last && batches.last().is_some_and(|b| b.len() < self.cfg.batch_size) {
            batches.pop();
        }
        batches
    }

    pub fn epoch(&self, epoch: usize) -> DatasetResult<EpochIter> {
        let batches = self.epoch_batches(epoch);
        let total = batches.len();
        let workers = self.cfg.num_workers.clamp(1, total.max(1));

        let mut assigned: Vec<Vec<Vec<usize>>> = vec![Vec::new(); workers];
        for (b, batch) in batches.into_iter().enumerate() {
            assigned[b % workers].push(batch);
        }

        // workers log through the caller's subscriber
        let dispatch = tracing::dispatcher::get_default(Clone::clone);
        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for (worker, batches) in assigned.into_iter().enumerate() {
            let (tx, rx) = bounded(self.cfg.prefetch.max(1));
            let job = WorkerJob {
                worker,
                batches,
                dataset: Arc::clone(&self.dataset),
                transform: self.transform.clone(),
                seed: self.cfg.seed.wrapping_add(worker as u64),
                num_classes: self.cfg.num_classes,
            };
            let dispatch = dispatch.clone();
            let handle = std::thread::Builder::new()
                .name(format!("seg-loader-{worker}"))
                .spawn(move || {
                    let _log = tracing::dispatcher::set_default(&dispatch);
                    job.run(tx)
                })
                .map_err(|e| SegDatasetError::Worker {
                    worker,
                    msg: format!("spawn failed: {e}"),
                })?;
            receivers.push(rx);
            handles.push(handle);
        }

        Ok(EpochIter {
            receivers,
            handles,
            next: 0,
            total,
            failed: false,
        })
    }
}

struct WorkerJob {
    worker: usize,
    batches: Vec<Vec<usize>>,
    dataset: Arc<dyn SegmentationDataset>,
    transform: Option<RandomGenerator>,
    seed: u64,
    num_classes: Option<usize>,
}

impl WorkerJob {
    fn run(self, tx: Sender<DatasetResult<HostBatch>>) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        tracing::trace!(worker = self.worker, batches = self.batches.len(), "loader worker started");
        for indices in &self.batches {
            let result = self.load_batch(indices, &mut rng);
            let failed = result.is_err();
            if tx.send(result).is_err() || failed {
                return;
            }
        }
    }

    fn load_batch(&self, indices: &[usize], rng: &mut StdRng) -> DatasetResult<HostBatch> {
        let mut samples = Vec::with_capacity(indices.len());
        for &index in indices {
            let mut sample = self.dataset.get(index)?;
            if let Some(transform) = &self.transform {
                sample = transform.apply(sample, rng)?;
            }
            if let Some(num_classes) = self.num_classes {
                sample.check_labels(num_classes)?;
            }
            samples.push(sample);
        }
        HostBatch::collate(samples)
    }
}

/// In-order batches of one epoch. Dropping it stops and joins the workers.
pub struct EpochIter {
    receivers: Vec<Receiver<DatasetResult<HostBatch>>>,
    handles: Vec<JoinHandle<()>>,
    next: usize,
    total: usize,
    failed: bool,
}

impl EpochIter {
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for EpochIter {
    type Item = DatasetResult<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.total {
            return None;
        }
        let worker = self.next % self.receivers.len();
        self.next += 1;
        let item = match self.receivers[worker].recv() {
            Ok(item) => item,
            Err(_) => Err(SegDatasetError::Worker {
                worker,
                msg: "channel closed before the epoch finished".to_string(),
            }),
        };
        self.failed = item.is_err();
        Some(item)
    }
}

impl Drop for EpochIter {
    fn drop(&mut self) {
        self.receivers.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("loader worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::InMemoryDataset;

    fn dataset(n: usize) -> Arc<dyn SegmentationDataset> {
        let samples = (0..n)
            .map(|i| SegSample::new(format!("s{i}"), vec![i as f32; 4], vec![0; 4], 1, 2, 2).unwrap())
            .collect();
        Arc::new(InMemoryDataset::new(samples))
    }

    #[test]
    fn len_rounds_up_unless_drop_last() {
        let cfg = LoaderConfig {
            batch_size: 4,
            ..Default::default()
        };
        let loader = SegLoader::new(dataset(10), None, cfg.clone()).unwrap();
        assert_eq!(loader.len(), 3);
        let loader = SegLoader::new(
            dataset(10),
            None,
            LoaderConfig {
                drop_last: true,
                ..cfg
            },
        )
        .unwrap();
        assert_eq!(loader.len(), 2);
        assert_eq!(loader.epoch_batches(0).len(), 2);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let cfg = LoaderConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(SegLoader::new(dataset(1), None, cfg).is_err());
    }

    #[test]
    fn collate_rejects_mixed_shapes() {
        let a = SegSample::new("a", vec![0.0; 4], vec![0; 4], 1, 2, 2).unwrap();
        let b = SegSample::new("b", vec![0.0; 6], vec![0; 6], 1, 2, 3).unwrap();
        assert!(matches!(
            HostBatch::collate(vec![a, b]),
            Err(SegDatasetError::ShapeMismatch { .. })
        ));
    }
}
