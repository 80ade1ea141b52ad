//! Segmentation losses: pixel-wise cross-entropy, soft Dice and their weighted sum.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::tensor::activation::softmax;
use burn::tensor::{backend::Backend, Int, Tensor};
use serde::{Deserialize, Serialize};

/// Mean cross-entropy over every pixel. `logits` is `[N, C, H, W]`, `labels` is `[N, H, W]`.
pub fn cross_entropy_2d<B: Backend>(logits: Tensor<B, 4>, labels: Tensor<B, 3, Int>) -> Tensor<B, 1> {
    let [n, c, h, w] = logits.dims();
    let device = logits.device();
    // NCHW -> NHWC so each row is one pixel's class scores
    let flat = logits.swap_dims(1, 2).swap_dims(2, 3).reshape([n * h * w, c]);
    let targets = labels.reshape([n * h * w]);
    CrossEntropyLossConfig::new()
        .init(&device)
        .forward(flat, targets)
}

/// Soft Dice loss averaged over classes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiceLoss {
    n_classes: usize,
    smooth: f32,
}

impl DiceLoss {
    pub fn new(n_classes: usize) -> Self {
        Self {
            n_classes,
            smooth: 1e-5,
        }
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// `1 - (2·Σpt + s) / (Σp² + Σt² + s)` per class, averaged.
    ///
    /// With `softmax` set, `inputs` are raw logits; otherwise they are taken
    /// as per-class probabilities already.
    pub fn forward<B: Backend>(
        &self,
        inputs: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
        softmax_inputs: bool,
    ) -> Tensor<B, 1> {
        let device = inputs.device();
        let per_class = self.per_class(inputs, labels, softmax_inputs);
        let count = per_class.len().max(1) as f32;
        per_class
            .into_iter()
            .fold(Tensor::zeros([1], &device), |acc, loss| acc + loss)
            .div_scalar(count)
    }

    pub fn per_class<B: Backend>(
        &self,
        inputs: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
        softmax_inputs: bool,
    ) -> Vec<Tensor<B, 1>> {
        let [n, c, h, w] = inputs.dims();
        let probs = if softmax_inputs {
            softmax(inputs, 1)
        } else {
            inputs
        };
        (0..self.n_classes.min(c))
            .map(|class| {
                let score = probs
                    .clone()
                    .slice([0..n, class..class + 1, 0..h, 0..w])
                    .reshape([n, h, w]);
                let target = labels.clone().equal_elem(class as i64).float();
                self.dice(score, target)
            })
            .collect()
    }

    fn dice<B: Backend>(&self, score: Tensor<B, 3>, target: Tensor<B, 3>) -> Tensor<B, 1> {
        let intersect = (score.clone() * target.clone()).sum();
        let y_sum = (target.clone() * target).sum();
        let z_sum = (score.clone() * score).sum();
        let ratio = intersect
            .mul_scalar(2.0)
            .add_scalar(self.smooth)
            .div((z_sum + y_sum).add_scalar(self.smooth));
        ratio.neg().add_scalar(1.0)
    }
}

/// Weights of the loss terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub ce: f32,
    pub dice: f32,
    /// Feature-distillation coefficient; zero disables the term.
    pub kd: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            ce: 0.4,
            dice: 0.6,
            kd: 0.0,
        }
    }
}

impl LossWeights {
    pub fn kd_enabled(&self) -> bool {
        self.kd > 0.0
    }

    /// `ce·CE + dice·Dice`, plus the distillation term when given. The
    /// distillation term arrives already scaled by its own coefficient.
    pub fn combine<B: Backend>(
        &self,
        ce: Tensor<B, 1>,
        dice: Tensor<B, 1>,
        kd: Option<Tensor<B, 1>>,
    ) -> LossBreakdown<B> {
        let mut total = ce.clone().mul_scalar(self.ce) + dice.clone().mul_scalar(self.dice);
        if let Some(kd) = &kd {
            total = total + kd.clone();
        }
        LossBreakdown { total, ce, dice, kd }
    }
}

#[derive(Debug, Clone)]
pub struct LossBreakdown<B: Backend> {
    pub total: Tensor<B, 1>,
    pub ce: Tensor<B, 1>,
    pub dice: Tensor<B, 1>,
    pub kd: Option<Tensor<B, 1>>,
}

/// Host copies of a [`LossBreakdown`], for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossValues {
    pub total: f32,
    pub ce: f32,
    pub dice: f32,
    pub kd: Option<f32>,
}

impl<B: Backend> LossBreakdown<B> {
    pub fn values(&self) -> LossValues {
        LossValues {
            total: scalar(&self.total),
            ce: scalar(&self.ce),
            dice: scalar(&self.dice),
            kd: self.kd.as_ref().map(scalar),
        }
    }
}

/// First element of a tensor as `f32`; NaN if the read-back fails.
pub fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> f32 {
    tensor
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .first()
        .copied()
        .unwrap_or(f32::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn labels(values: Vec<i64>, shape: [usize; 3]) -> Tensor<B, 3, Int> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    #[test]
    fn uniform_logits_give_log_c_cross_entropy() {
        let device = Default::default();
        let logits = Tensor::<B, 4>::zeros([2, 4, 3, 3], &device);
        let ce = scalar(&cross_entropy_2d(logits, labels(vec![1; 18], [2, 3, 3])));
        assert!((ce - 4f32.ln()).abs() < 1e-5, "ce {ce}");
    }

    #[test]
    fn confident_correct_prediction_has_near_zero_losses() {
        let device = Default::default();
        // class 0 on the left column, class 1 on the right
        let label = labels(vec![0, 1, 0, 1], [1, 2, 2]);
        let logits = Tensor::<B, 4>::from_data(
            TensorData::new(
                vec![20.0f32, -20.0, 20.0, -20.0, -20.0, 20.0, -20.0, 20.0],
                [1, 2, 2, 2],
            ),
            &device,
        );
        let ce = scalar(&cross_entropy_2d(logits.clone(), label.clone()));
        let dice = scalar(&DiceLoss::new(2).forward(logits, label, true));
        assert!(ce < 1e-4, "ce {ce}");
        assert!(dice < 1e-4, "dice {dice}");
    }

    #[test]
    fn dice_of_disjoint_probabilities_is_one() {
        let device = Default::default();
        let label = labels(vec![1, 1, 1, 1], [1, 2, 2]);
        let probs = Tensor::<B, 4>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0], [1, 2, 2, 2]),
            &device,
        );
        let per_class: Vec<f32> = DiceLoss::new(2)
            .per_class(probs, label, false)
            .iter()
            .map(scalar)
            .collect();
        assert!((per_class[0] - 1.0).abs() < 1e-4);
        assert!((per_class[1] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn combine_without_kd_is_weighted_sum() {
        let device = Default::default();
        let ce = Tensor::<B, 1>::from_floats([1.5], &device);
        let dice = Tensor::<B, 1>::from_floats([0.25], &device);
        let values = LossWeights::default().combine(ce, dice, None).values();
        assert!((values.total - (0.4 * 1.5 + 0.6 * 0.25)).abs() < 1e-6);
        assert_eq!(values.kd, None);
    }
}
