//! Hard-label Dice evaluation of a trained network.

use burn::tensor::backend::Backend;
use models::UNetSta;
use seg_dataset::SegLoader;

/// Pixel counts accumulated per class over a whole split.
#[derive(Debug, Clone, PartialEq)]
pub struct DiceCounts {
    intersect: Vec<u64>,
    predicted: Vec<u64>,
    target: Vec<u64>,
}

impl DiceCounts {
    pub fn new(num_classes: usize) -> Self {
        Self {
            intersect: vec![0; num_classes],
            predicted: vec![0; num_classes],
            target: vec![0; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.intersect.len()
    }

    /// Values outside `0..num_classes` are ignored.
    pub fn update(&mut self, predicted: &[i64], target: &[i64]) {
        let n = self.num_classes() as i64;
        for (&p, &t) in predicted.iter().zip(target) {
            if (0..n).contains(&p) {
                self.predicted[p as usize] += 1;
            }
            if (0..n).contains(&t) {
                self.target[t as usize] += 1;
                if p == t {
                    self.intersect[t as usize] += 1;
                }
            }
        }
    }

    /// `2|P∩T| / (|P| + |T|)` per class; 1.0 for a class absent from both.
    pub fn per_class(&self) -> Vec<f64> {
        (0..self.num_classes())
            .map(|c| {
                let denom = self.predicted[c] + self.target[c];
                if denom == 0 {
                    1.0
                } else {
                    2.0 * self.intersect[c] as f64 / denom as f64
                }
            })
            .collect()
    }

    /// Mean over foreground classes (class 0 is background).
    pub fn mean_foreground(&self) -> f64 {
        let per_class = self.per_class();
        let fg = per_class.get(1..).unwrap_or(&[]);
        if fg.is_empty() {
            return per_class.first().copied().unwrap_or(0.0);
        }
        fg.iter().sum::<f64>() / fg.len() as f64
    }
}

#[derive(Debug, Clone)]
pub struct EvalReport {
    pub samples: usize,
    pub per_class: Vec<f64>,
    pub mean_dice: f64,
}

/// Runs `model` over one pass of `loader` and scores argmax predictions.
pub fn evaluate<B: Backend>(
    model: &UNetSta<B>,
    loader: &SegLoader,
    num_classes: usize,
    device: &B::Device,
) -> anyhow::Result<EvalReport> {
    let mut counts = DiceCounts::new(num_classes);
    let mut samples = 0;
    for batch in loader.epoch(0)? {
        let batch = batch?;
        samples += batch.batch;
        let labels = batch.labels.clone();
        let tensors = batch.to_tensors::<B>(device);
        let predicted = model
            .forward(tensors.images)
            .argmax(1)
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| anyhow::anyhow!("failed to read predictions: {e:?}"))?;
        counts.update(&predicted, &labels);
    }
    Ok(EvalReport {
        samples,
        per_class: counts.per_class(),
        mean_dice: counts.mean_foreground(),
    })
}
